//! Domain Module
//!
//! Platform-independent pieces of the car controller: the device registry,
//! the pairing state machine, the observable state hub, the phrase
//! interpreter and settings.

pub mod devices;
pub mod models;
pub mod pairing;
pub mod phrases;
pub mod settings;
pub mod state;
