use serde::{Deserialize, Serialize};

/// Platform bond state of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BondState {
    #[default]
    None,
    Bonding,
    Bonded,
}

/// A remote device as observed through discovery or bonded-device enumeration.
///
/// The hardware address is the identity; everything else may be refined by
/// later observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub address: String,
    pub name: Option<String>,
    pub bond_state: BondState,
}

impl Device {
    pub fn new(address: impl Into<String>, name: Option<&str>, bond_state: BondState) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_string),
            bond_state,
        }
    }

    /// True when the device carries a non-empty name
    pub fn has_name(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.is_empty())
    }

    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "Unknown",
        }
    }

    pub fn is_bonded(&self) -> bool {
        self.bond_state == BondState::Bonded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingStatus {
    #[default]
    Idle,
    Bonding,
    Success,
    Failed,
    /// Every queued credential was rejected; waiting for one from the operator
    NeedsCredential,
}

impl PairingStatus {
    /// States that `reset` is allowed to leave
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PairingStatus::Success | PairingStatus::Failed | PairingStatus::NeedsCredential
        )
    }
}

/// Answer to a platform credential request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinReply {
    /// Supply this PIN and suppress the platform prompt
    Supply(String),
    /// Let the platform show its own prompt
    Prompt,
}

/// Runtime authorizations the host platform may withhold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Scan,
    Connect,
}

/// Direction of a continuous movement command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
    ForwardLeft,
    ForwardRight,
    BackwardLeft,
    BackwardRight,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_counts_as_unnamed() {
        let device = Device::new("00:11:22:33:44:55", Some(""), BondState::None);
        assert!(!device.has_name());
        assert_eq!(device.display_name(), "Unknown");
    }

    #[test]
    fn test_only_terminal_statuses_are_settled() {
        assert!(!PairingStatus::Idle.is_settled());
        assert!(!PairingStatus::Bonding.is_settled());
        assert!(PairingStatus::Failed.is_settled());
        assert!(PairingStatus::NeedsCredential.is_settled());
    }
}
