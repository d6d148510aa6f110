//! Transport Adapter
//!
//! The platform radio is owned outside this crate. The core reaches it only
//! through [`Transport`]. Calls on the trait may block; the core runs them on
//! the blocking pool.
//!
//! Platform notifications arrive on channels. A subscription lives exactly
//! as long as its receiver, so dropping the receiver unregisters it.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::domain::models::{BondState, Device, PinReply};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bluetooth adapter is unavailable or disabled")]
    RadioOff,

    #[error("Permission denied by the platform")]
    PermissionDenied,

    #[error("No device with address {0}")]
    UnknownDevice(String),

    #[error("Service {0} is not offered by the remote device")]
    ServiceNotFound(Uuid),

    #[error("No open serial session")]
    NotConnected,

    #[error("Serial stream I/O failed: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Bluetooth stack error: {0}")]
    Platform(String),
}

/// Notification produced while discovery is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    DeviceFound(Device),
    NameChanged { address: String, name: String },
}

/// Notification about bonding, for any device on the adapter
#[derive(Debug)]
pub enum BondEvent {
    StateChanged { address: String, state: BondState },
    /// The platform wants a PIN. Dropping `reply` without answering leaves
    /// the platform's own prompt in charge.
    PinRequested {
        address: String,
        reply: oneshot::Sender<PinReply>,
    },
}

/// Exclusive serial byte stream to one remote device
pub trait SerialStream: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Close the output side of the stream
    fn close_output(&mut self) -> Result<(), TransportError>;

    /// Close the underlying socket
    fn close(&mut self) -> Result<(), TransportError>;
}

pub trait Transport: Send + Sync + 'static {
    fn is_enabled(&self) -> bool;

    fn bonded_devices(&self) -> Result<Vec<Device>, TransportError>;

    /// Start discovery, delivering notifications to `events` until stopped
    fn start_discovery(
        &self,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<(), TransportError>;

    fn stop_discovery(&self) -> Result<(), TransportError>;

    /// Subscribe to bond-state and PIN-request notifications
    fn bond_events(&self) -> mpsc::UnboundedReceiver<BondEvent>;

    /// Ask the platform to bond with `address`; the outcome arrives as
    /// [`BondEvent::StateChanged`]
    fn create_bond(&self, address: &str) -> Result<(), TransportError>;

    fn open_stream(
        &self,
        address: &str,
        service: Uuid,
    ) -> Result<Box<dyn SerialStream>, TransportError>;
}
