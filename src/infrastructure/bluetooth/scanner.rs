//! Discovery Scanner
//!
//! Runs a discovery session against the transport and folds its
//! notifications into the shared device registry.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::devices::{present, DeviceRegistry};
use crate::domain::state::CarState;
use crate::infrastructure::bluetooth::transport::{DiscoveryEvent, Transport, TransportError};

pub type SharedRegistry = Arc<Mutex<DeviceRegistry>>;

pub(crate) fn lock_registry(registry: &Mutex<DeviceRegistry>) -> MutexGuard<'_, DeviceRegistry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Recompute the presented list from the registry. The registry stays locked
/// while publishing so concurrent publishers cannot reorder their results.
pub fn publish_devices(registry: &Mutex<DeviceRegistry>, state: &CarState) {
    let registry = lock_registry(registry);
    let shown = present(&registry.merged(), state.hide_unnamed.get());
    state.devices.set(shown);
}

/// Live discovery session; dropping it stops folding notifications
struct DiscoverySession {
    task: JoinHandle<()>,
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Scanner<T: Transport> {
    transport: Arc<T>,
    state: Arc<CarState>,
    registry: SharedRegistry,
    session: Option<DiscoverySession>,
}

impl<T: Transport> Scanner<T> {
    pub fn new(transport: Arc<T>, state: Arc<CarState>, registry: SharedRegistry) -> Self {
        Self {
            transport,
            state,
            registry,
            session: None,
        }
    }

    /// Start discovery. Returns false when nothing was started: already
    /// scanning, radio off, or the platform refused.
    pub async fn start(&mut self) -> bool {
        if self.session.is_some() {
            debug!("Discovery already running");
            return false;
        }

        let enabled = self.transport.is_enabled();
        self.state.bluetooth_enabled.set(enabled);
        if !enabled {
            info!("Bluetooth is disabled, not scanning");
            return false;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.transport.clone();
        let started = tokio::task::spawn_blocking(move || transport.start_discovery(events_tx))
            .await
            .unwrap_or_else(|e| Err(TransportError::Platform(e.to_string())));

        if let Err(e) = started {
            warn!("Failed to start discovery: {}", e);
            if matches!(e, TransportError::RadioOff) {
                self.state.bluetooth_enabled.set(false);
            }
            return false;
        }

        info!("Discovery started");
        let task = tokio::spawn(fold_discovery_events(
            events_rx,
            self.registry.clone(),
            self.state.clone(),
        ));
        self.session = Some(DiscoverySession { task });
        self.state.is_scanning.set(true);
        true
    }

    /// Stop discovery. Safe to call when not scanning.
    pub async fn stop(&mut self) {
        // Dropping the session ends the fold task before the platform call
        let Some(session) = self.session.take() else {
            self.state.is_scanning.set(false);
            return;
        };
        drop(session);

        let transport = self.transport.clone();
        let stopped = tokio::task::spawn_blocking(move || transport.stop_discovery())
            .await
            .unwrap_or_else(|e| Err(TransportError::Platform(e.to_string())));
        if let Err(e) = stopped {
            warn!("Failed to stop discovery cleanly: {}", e);
        }

        info!("Discovery stopped");
        self.state.is_scanning.set(false);
    }

    pub fn is_scanning(&self) -> bool {
        self.session.is_some()
    }
}

async fn fold_discovery_events(
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    registry: SharedRegistry,
    state: Arc<CarState>,
) {
    while let Some(event) = events.recv().await {
        let changed = {
            let mut registry = lock_registry(&registry);
            match event {
                DiscoveryEvent::DeviceFound(device) => {
                    debug!("Found {} ({})", device.address, device.display_name());
                    registry.observe(device)
                }
                DiscoveryEvent::NameChanged { address, name } => registry.rename(&address, &name),
            }
        };
        if changed {
            publish_devices(&registry, &state);
        }
    }
    debug!("Discovery notifications closed");
}
