//! Car Serial Protocol
//!
//! The car's onboard receiver listens on the Serial Port Profile and reads
//! single ASCII bytes, one per command.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::domain::models::Direction;

/// Serial Port Profile service record shared by the car's receiver
pub const SERIAL_PORT_SERVICE_UUID: &str = "00001101-0000-1000-8000-00805F9B34FB";

/// Cadence of continuous commands in milliseconds
pub const REPEAT_INTERVAL_MS: u64 = 100;

/// How long a spoken "horn" keeps the horn on, in milliseconds
pub const HORN_PULSE_MS: u64 = 500;

pub fn serial_port_service_uuid() -> Uuid {
    Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb)
}

/// Commands understood by the car
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CarCommand {
    Forward,
    Backward,
    Left,
    Right,
    ForwardLeft,
    ForwardRight,
    BackwardLeft,
    BackwardRight,
    /// Release for every movement command
    Stop,
    HornOn,
    HornOff,
    FrontLightOn,
    FrontLightOff,
    BackLightOn,
    BackLightOff,
}

impl CarCommand {
    pub const ALL: [CarCommand; 15] = [
        CarCommand::Forward,
        CarCommand::Backward,
        CarCommand::Left,
        CarCommand::Right,
        CarCommand::ForwardLeft,
        CarCommand::ForwardRight,
        CarCommand::BackwardLeft,
        CarCommand::BackwardRight,
        CarCommand::Stop,
        CarCommand::HornOn,
        CarCommand::HornOff,
        CarCommand::FrontLightOn,
        CarCommand::FrontLightOff,
        CarCommand::BackLightOn,
        CarCommand::BackLightOff,
    ];

    pub fn as_char(&self) -> char {
        match self {
            Self::Forward => 'F',
            Self::Backward => 'B',
            Self::Left => 'L',
            Self::Right => 'R',
            Self::ForwardLeft => 'G',
            Self::ForwardRight => 'I',
            Self::BackwardLeft => 'H',
            Self::BackwardRight => 'J',
            Self::Stop => 'S',
            Self::HornOn => 'V',
            Self::HornOff => 'v',
            Self::FrontLightOn => 'W',
            Self::FrontLightOff => 'w',
            Self::BackLightOn => 'U',
            Self::BackLightOff => 'u',
        }
    }

    /// Raw bytes written to the serial stream
    pub fn as_bytes(&self) -> [u8; 1] {
        [self.as_char() as u8]
    }

    pub fn from_char(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| cmd.as_char() == c)
    }

    pub fn front_light(on: bool) -> Self {
        if on {
            Self::FrontLightOn
        } else {
            Self::FrontLightOff
        }
    }

    pub fn back_light(on: bool) -> Self {
        if on {
            Self::BackLightOn
        } else {
            Self::BackLightOff
        }
    }
}

impl From<Direction> for CarCommand {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Forward => Self::Forward,
            Direction::Backward => Self::Backward,
            Direction::Left => Self::Left,
            Direction::Right => Self::Right,
            Direction::ForwardLeft => Self::ForwardLeft,
            Direction::ForwardRight => Self::ForwardRight,
            Direction::BackwardLeft => Self::BackwardLeft,
            Direction::BackwardRight => Self::BackwardRight,
        }
    }
}

impl fmt::Display for CarCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown command token {0:?}")]
pub struct UnknownCommand(pub String);

impl FromStr for CarCommand {
    type Err = UnknownCommand;

    /// Tokens are exactly one character of the alphabet
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let mut chars = token.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_char(c).ok_or_else(|| UnknownCommand(token.to_string())),
            _ => Err(UnknownCommand(token.to_string())),
        }
    }
}

/// Continuous commands of one class exclude each other; classes are independent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    Movement,
    Horn,
}

impl CommandClass {
    /// Token sent exactly once when a held command is released
    pub fn release(&self) -> CarCommand {
        match self {
            Self::Movement => CarCommand::Stop,
            Self::Horn => CarCommand::HornOff,
        }
    }
}
