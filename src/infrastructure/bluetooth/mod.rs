//! Bluetooth Module
//!
//! Classic Bluetooth control of a hobby car over a serial stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │    (coordinator, publishes everything to CarState)       │
//! └──────┬──────────────┬──────────────┬──────────────┬─────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │   Pairer   │  │ Connection │◀─│  Driver  │
//! │ discovery │  │ PIN retry  │  │ serial     │  │ loops    │
//! └─────┬─────┘  └─────┬──────┘  └─────┬──────┘  └──────────┘
//!       └──────────────┴───────┬───────┘
//!                              ▼
//!                     Transport (platform)
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Platform radio abstraction and its notifications
//! - [`simulated`] - In-memory radio for the console and tests
//! - [`protocol`] - Command alphabet and service record
//! - [`scanner`] - Discovery sessions and the device list
//! - [`pairing`] - Bonding with automatic PIN retry
//! - [`connection`] - The exclusive serial session
//! - [`driver`] - One-shot and continuous commands
//! - [`service`] - Main service coordinator

pub mod connection;
pub mod driver;
pub mod pairing;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod transport;

// Re-export main service for convenience
pub use service::BluetoothService;
