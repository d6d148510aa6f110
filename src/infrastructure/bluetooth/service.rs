//! Bluetooth Service Module
//!
//! Main service that coordinates discovery, pairing, the serial session and
//! command sending for the car. Every operation reports through the
//! [`CarState`] hub and a boolean; nothing propagates out as an error.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::models::{BondState, Capability, Device, Direction};
use crate::domain::phrases::{self, PhraseCommand};
use crate::domain::settings::Settings;
use crate::domain::state::CarState;
use crate::infrastructure::bluetooth::{
    connection::{Connection, ConnectionConfig},
    driver::{CommandDriver, CommandSink, SharedConnection},
    pairing::Pairer,
    protocol::{self, CarCommand, CommandClass},
    scanner::{lock_registry, publish_devices, Scanner, SharedRegistry},
    transport::{Transport, TransportError},
};

/// Host authorization check consulted before scanning or connecting
pub type CapabilityCheck = Arc<dyn Fn(Capability) -> bool + Send + Sync>;

pub const CONNECT_FAILED: &str = "Failed to connect to device";

struct Inner<T: Transport> {
    transport: Arc<T>,
    settings: Settings,
    capabilities: CapabilityCheck,
    state: Arc<CarState>,
    registry: SharedRegistry,
    scanner: tokio::sync::Mutex<Scanner<T>>,
    pairer: tokio::sync::Mutex<Pairer<T>>,
    connection: SharedConnection<T>,
    driver: CommandDriver<T>,
    /// Serializes connect and disconnect
    lifecycle: tokio::sync::Mutex<()>,
    bonded_listener: Mutex<Option<JoinHandle<()>>>,
}

/// Main service coordinating all car operations. Cheap to clone.
pub struct BluetoothService<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for BluetoothService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> BluetoothService<T> {
    /// Create the service. Must be called from within a tokio runtime.
    pub fn new(
        transport: T,
        settings: Settings,
        capabilities: impl Fn(Capability) -> bool + Send + Sync + 'static,
    ) -> Self {
        let transport = Arc::new(transport);
        let state = Arc::new(CarState::new(transport.is_enabled()));
        let registry = SharedRegistry::default();
        let (bonded_tx, bonded_rx) = mpsc::unbounded_channel();

        let connection: SharedConnection<T> = Arc::new(tokio::sync::Mutex::new(Connection::new(
            transport.clone(),
            ConnectionConfig {
                service_uuid: settings.service_uuid(),
            },
        )));
        let driver = CommandDriver::new(
            CommandSink::new(connection.clone(), state.clone()),
            settings.repeat_interval(),
        );

        let inner = Arc::new(Inner {
            scanner: tokio::sync::Mutex::new(Scanner::new(
                transport.clone(),
                state.clone(),
                registry.clone(),
            )),
            pairer: tokio::sync::Mutex::new(Pairer::new(transport.clone(), state.clone(), bonded_tx)),
            transport,
            settings,
            capabilities: Arc::new(capabilities),
            state,
            registry,
            connection,
            driver,
            lifecycle: tokio::sync::Mutex::new(()),
            bonded_listener: Mutex::new(None),
        });

        let listener = spawn_bonded_listener(Arc::downgrade(&inner), bonded_rx);
        if let Ok(mut slot) = inner.bonded_listener.lock() {
            *slot = Some(listener);
        }

        Self { inner }
    }

    /// Service for hosts that never withhold authorization
    pub fn unrestricted(transport: T, settings: Settings) -> Self {
        Self::new(transport, settings, |_| true)
    }

    /// Observable state hub
    pub fn state(&self) -> Arc<CarState> {
        self.inner.state.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    fn allowed(&self, capability: Capability) -> bool {
        let allowed = (self.inner.capabilities)(capability);
        if !allowed {
            debug!("{:?} capability not granted, skipping", capability);
        }
        allowed
    }

    // ---- Discovery ----

    /// Start scanning for devices
    pub async fn start_discovery(&self) -> bool {
        if !self.allowed(Capability::Scan) {
            return false;
        }
        self.inner.scanner.lock().await.start().await
    }

    /// Stop scanning
    pub async fn stop_discovery(&self) {
        if !self.allowed(Capability::Scan) {
            return;
        }
        self.inner.scanner.lock().await.stop().await;
    }

    /// Enumerate bonded devices and publish them without scanning
    pub async fn load_bonded_devices(&self) -> bool {
        if !self.allowed(Capability::Connect) {
            return false;
        }
        if !self.refresh_bluetooth_status() {
            return false;
        }

        let transport = self.inner.transport.clone();
        let bonded = tokio::task::spawn_blocking(move || transport.bonded_devices())
            .await
            .unwrap_or_else(|e| Err(TransportError::Platform(e.to_string())));

        match bonded {
            Ok(devices) => {
                info!("Loaded {} bonded devices", devices.len());
                lock_registry(&self.inner.registry).set_bonded(devices);
                publish_devices(&self.inner.registry, &self.inner.state);
                true
            }
            Err(e) => {
                warn!("Failed to enumerate bonded devices: {}", e);
                false
            }
        }
    }

    /// Toggle the unnamed-device filter; the observed set is untouched
    pub fn set_hide_unnamed(&self, hide: bool) {
        self.inner.state.hide_unnamed.set(hide);
        publish_devices(&self.inner.registry, &self.inner.state);
    }

    /// Re-read whether the radio is on
    pub fn refresh_bluetooth_status(&self) -> bool {
        let enabled = self.inner.transport.is_enabled();
        self.inner.state.bluetooth_enabled.set(enabled);
        enabled
    }

    // ---- Pairing ----

    /// Bond with `device` using the configured PINs, then connect.
    /// A device that is already bonded is connected directly.
    pub async fn pair(&self, device: Device) -> bool {
        if !self.allowed(Capability::Connect) {
            return false;
        }

        let bonded = device.is_bonded()
            || lock_registry(&self.inner.registry)
                .find(&device.address)
                .is_some_and(Device::is_bonded);
        if bonded {
            info!("{} is already bonded, connecting directly", device.address);
            return self.connect(&device.address).await;
        }

        let pins = self.inner.settings.default_pins.clone();
        self.inner.pairer.lock().await.pair(device, pins).await
    }

    /// Retry a stalled pairing with the operator's PIN
    pub async fn provide_credential(&self, pin: &str) -> bool {
        self.inner.pairer.lock().await.provide_credential(pin).await
    }

    /// Clear a finished pairing result
    pub async fn reset_pairing(&self) -> bool {
        self.inner.pairer.lock().await.reset().await
    }

    // ---- Connection ----

    /// Connect to a device by address. Discovery is stopped first.
    pub async fn connect(&self, address: &str) -> bool {
        if !self.allowed(Capability::Connect) {
            return false;
        }

        let _lifecycle = self.inner.lifecycle.lock().await;
        let state = &self.inner.state;
        state.is_connecting.set(true);
        let connected = self.open_session(address).await;
        state.is_connecting.set(false);
        connected
    }

    async fn open_session(&self, address: &str) -> bool {
        let state = &self.inner.state;

        self.inner.scanner.lock().await.stop().await;
        self.inner.driver.cancel_all().await;

        let opened = if self.refresh_bluetooth_status() {
            self.inner.connection.lock().await.open(address).await
        } else {
            Err(TransportError::RadioOff)
        };

        match opened {
            Ok(()) => {
                info!("Connected to {}", address);
                state.last_error.set(None);
                state.is_connected.set(true);
                true
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", address, e);
                state.is_connected.set(false);
                state.last_error.set(Some(CONNECT_FAILED.to_string()));
                false
            }
        }
    }

    /// Close the session. Running loops stop without sending their release.
    pub async fn disconnect(&self) -> bool {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.driver.cancel_all().await;
        let closed = self.inner.connection.lock().await.close().await;
        self.inner.state.is_connected.set(false);
        if closed {
            info!("Disconnected from car");
        }
        closed
    }

    /// Dismiss the last error message
    pub fn clear_error(&self) {
        self.inner.state.last_error.set(None);
    }

    // ---- Commands ----

    /// Send one command if connected
    pub async fn send(&self, command: CarCommand) -> bool {
        self.inner.driver.send(command).await
    }

    /// Keep moving in `direction` until `stop_moving`
    pub async fn start_moving(&self, direction: Direction) {
        self.inner
            .driver
            .start(CommandClass::Movement, direction.into())
            .await;
    }

    /// Stop the movement loop and send `S`
    pub async fn stop_moving(&self) -> bool {
        self.inner.driver.stop(CommandClass::Movement).await
    }

    /// Sound the horn until `stop_horn`
    pub async fn start_horn(&self) {
        self.inner
            .driver
            .start(CommandClass::Horn, CarCommand::HornOn)
            .await;
    }

    /// Stop the horn loop and send `v`
    pub async fn stop_horn(&self) -> bool {
        self.inner.driver.stop(CommandClass::Horn).await
    }

    /// Switch the front light
    pub async fn set_front_light(&self, on: bool) -> bool {
        self.send(CarCommand::front_light(on)).await
    }

    /// Switch the back light
    pub async fn set_back_light(&self, on: bool) -> bool {
        self.send(CarCommand::back_light(on)).await
    }

    /// Act on a transcribed phrase. Returns what it was understood as.
    pub async fn handle_phrase(&self, phrase: &str) -> Option<PhraseCommand> {
        let Some(command) = phrases::interpret(phrase) else {
            debug!("Phrase not recognized: {:?}", phrase);
            return None;
        };

        match command {
            PhraseCommand::Move(direction) => self.start_moving(direction).await,
            PhraseCommand::Stop => {
                self.stop_moving().await;
            }
            PhraseCommand::FrontLight(on) => {
                self.set_front_light(on).await;
            }
            PhraseCommand::BackLight(on) => {
                self.set_back_light(on).await;
            }
            PhraseCommand::Horn => {
                self.start_horn().await;
                tokio::time::sleep(Duration::from_millis(protocol::HORN_PULSE_MS)).await;
                self.stop_horn().await;
            }
        }
        Some(command)
    }

    /// Stop discovery, drop any pairing attempt and close the session
    pub async fn shutdown(&self) {
        info!("Shutting down car service");
        self.inner.scanner.lock().await.stop().await;
        self.inner.pairer.lock().await.abandon().await;
        self.disconnect().await;
        if let Ok(mut slot) = self.inner.bonded_listener.lock() {
            if let Some(listener) = slot.take() {
                listener.abort();
            }
        }
    }
}

/// Connect to every device the pairer reports as freshly bonded
fn spawn_bonded_listener<T: Transport>(
    inner: Weak<Inner<T>>,
    mut bonded: mpsc::UnboundedReceiver<Device>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(device) = bonded.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            lock_registry(&inner.registry).set_bond_state(&device.address, BondState::Bonded);
            publish_devices(&inner.registry, &inner.state);

            let service = BluetoothService { inner };
            service.connect(&device.address).await;
        }
    })
}
