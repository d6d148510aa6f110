//! Observable State Hub
//!
//! Every value the presentation layer renders lives in an [`Observable`]
//! cell. A subscriber receives the current value on subscription and then
//! every later value in the order it was set. Nothing is coalesced or
//! deduplicated, so a short-lived `Failed` or a repeated `Bonding` always
//! reaches the subscriber.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::domain::models::{Device, PairingStatus};

struct Cell<T> {
    value: T,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

pub struct Observable<T> {
    cell: Mutex<Cell<T>>,
}

impl<T: Clone> Observable<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: Mutex::new(Cell {
                value,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cell<T>> {
        self.cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    pub fn set(&self, value: T) {
        self.update(|current| *current = value);
    }

    /// Mutate the value and notify subscribers while still holding the cell,
    /// so concurrent writers are observed in the order they committed.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut cell = self.lock();
        f(&mut cell.value);
        let value = cell.value.clone();
        cell.subscribers
            .retain(|subscriber| subscriber.send(value.clone()).is_ok());
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut cell = self.lock();
        if tx.send(cell.value.clone()).is_ok() {
            cell.subscribers.push(tx);
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        let mut cell = self.lock();
        cell.subscribers.retain(|s| !s.is_closed());
        cell.subscribers.len()
    }
}

impl<T: Clone + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// State shared between the core and its presentation layer
pub struct CarState {
    /// Filtered and sorted device list
    pub devices: Observable<Vec<Device>>,
    pub hide_unnamed: Observable<bool>,
    pub is_scanning: Observable<bool>,
    pub pairing_status: Observable<PairingStatus>,
    pub is_connected: Observable<bool>,
    pub is_connecting: Observable<bool>,
    pub last_error: Observable<Option<String>>,
    pub bluetooth_enabled: Observable<bool>,
}

impl CarState {
    pub fn new(bluetooth_enabled: bool) -> Self {
        Self {
            devices: Observable::default(),
            hide_unnamed: Observable::new(true),
            is_scanning: Observable::new(false),
            pairing_status: Observable::default(),
            is_connected: Observable::new(false),
            is_connecting: Observable::new(false),
            last_error: Observable::new(None),
            bluetooth_enabled: Observable::new(bluetooth_enabled),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            devices: self.devices.get(),
            hide_unnamed: self.hide_unnamed.get(),
            is_scanning: self.is_scanning.get(),
            pairing_status: self.pairing_status.get(),
            is_connected: self.is_connected.get(),
            is_connecting: self.is_connecting.get(),
            last_error: self.last_error.get(),
            bluetooth_enabled: self.bluetooth_enabled.get(),
        }
    }
}

/// Point-in-time copy of every cell
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub devices: Vec<Device>,
    pub hide_unnamed: bool,
    pub is_scanning: bool,
    pub pairing_status: PairingStatus,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub last_error: Option<String>,
    pub bluetooth_enabled: bool,
}
