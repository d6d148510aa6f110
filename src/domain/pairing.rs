//! Pairing State Machine
//!
//! Pure transition logic for bonding with one device. The async driver in
//! `infrastructure::bluetooth::pairing` feeds platform notifications in and
//! carries out the returned actions.
//!
//! ```text
//! Idle ──pair──▶ Bonding ──bonded──▶ Success
//!                 │  ▲
//!        failed,  │  │ failed, PINs left (retry)
//!        no PINs  ▼  │
//!          NeedsCredential ──provide_credential──▶ Bonding
//!
//! request error ─────────────────────────────────▶ Failed
//! ```

use std::collections::VecDeque;

use crate::domain::models::{BondState, Device, PairingStatus, PinReply};

/// Bonding attempt for a single target device
#[derive(Debug, Clone)]
struct PairingAttempt {
    target: Device,
    queue: VecDeque<String>,
    in_flight: Option<String>,
}

/// What the driver has to do after a bond-state notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BondOutcome {
    /// Not relevant to the current attempt
    Unchanged,
    /// Request bonding for the same device again
    Retry(Device),
    /// Bonding completed; the device is ready for a session
    Bonded(Device),
    /// Queue exhausted, waiting for `provide_credential`
    NeedsCredential,
}

#[derive(Debug, Default)]
pub struct PairingMachine {
    status: PairingStatus,
    attempt: Option<PairingAttempt>,
}

impl PairingMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> PairingStatus {
        self.status
    }

    /// Device of the live attempt, kept through `NeedsCredential`
    pub fn target(&self) -> Option<&Device> {
        self.attempt.as_ref().map(|a| &a.target)
    }

    pub fn is_bonding_with(&self, address: &str) -> bool {
        self.status == PairingStatus::Bonding
            && self.target().is_some_and(|t| t.address == address)
    }

    /// Begin a new attempt, replacing any previous one
    pub fn start(&mut self, target: Device, pins: impl IntoIterator<Item = String>) {
        self.attempt = Some(PairingAttempt {
            target,
            queue: pins.into_iter().collect(),
            in_flight: None,
        });
        self.status = PairingStatus::Bonding;
    }

    /// Answer a platform credential request.
    ///
    /// `None` means the request belongs to someone else's bonding flow and
    /// must be left alone.
    pub fn on_credential_request(&mut self, address: &str) -> Option<PinReply> {
        if !self.is_bonding_with(address) {
            return None;
        }
        let attempt = self.attempt.as_mut()?;
        match attempt.queue.pop_front() {
            Some(pin) => {
                attempt.in_flight = Some(pin.clone());
                Some(PinReply::Supply(pin))
            }
            None => {
                attempt.in_flight = None;
                Some(PinReply::Prompt)
            }
        }
    }

    pub fn on_bond_state(&mut self, address: &str, state: BondState) -> BondOutcome {
        if !self.is_bonding_with(address) {
            return BondOutcome::Unchanged;
        }

        match state {
            BondState::Bonding => BondOutcome::Unchanged,
            BondState::Bonded => {
                self.status = PairingStatus::Success;
                match self.attempt.take() {
                    Some(attempt) => {
                        let mut device = attempt.target;
                        device.bond_state = BondState::Bonded;
                        BondOutcome::Bonded(device)
                    }
                    None => BondOutcome::Unchanged,
                }
            }
            BondState::None => {
                let Some(attempt) = self.attempt.as_mut() else {
                    return BondOutcome::Unchanged;
                };
                // A failure before any PIN was asked for still consumes one
                // candidate so the retries stay bounded.
                if attempt.in_flight.take().is_none() {
                    attempt.queue.pop_front();
                }
                if attempt.queue.is_empty() {
                    self.status = PairingStatus::NeedsCredential;
                    BondOutcome::NeedsCredential
                } else {
                    BondOutcome::Retry(attempt.target.clone())
                }
            }
        }
    }

    /// The bonding request itself could not be issued
    pub fn on_request_error(&mut self) {
        self.status = PairingStatus::Failed;
        self.attempt = None;
    }

    /// Re-enter bonding with exactly the operator's PIN.
    /// Only valid while waiting for a credential.
    pub fn provide_credential(&mut self, pin: &str) -> Option<Device> {
        if self.status != PairingStatus::NeedsCredential {
            return None;
        }
        let target = self.attempt.as_ref()?.target.clone();
        self.start(target.clone(), [pin.to_string()]);
        Some(target)
    }

    /// Return to `Idle` from a settled state, discarding the attempt
    pub fn reset(&mut self) -> bool {
        match self.status {
            PairingStatus::Idle => true,
            status if status.is_settled() => {
                self.status = PairingStatus::Idle;
                self.attempt = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the attempt unconditionally; used on shutdown
    pub fn abandon(&mut self) {
        self.status = PairingStatus::Idle;
        self.attempt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAR: &str = "AA:BB:CC:DD:EE:FF";

    fn car() -> Device {
        Device::new(CAR, Some("Car"), BondState::None)
    }

    fn default_pins() -> Vec<String> {
        vec!["1234".to_string(), "0000".to_string()]
    }

    #[test]
    fn test_supplies_queued_pins_in_order() {
        let mut machine = PairingMachine::new();
        machine.start(car(), default_pins());

        assert_eq!(
            machine.on_credential_request(CAR),
            Some(PinReply::Supply("1234".into()))
        );
        assert_eq!(machine.on_bond_state(CAR, BondState::None), BondOutcome::Retry(car()));
        assert_eq!(machine.status(), PairingStatus::Bonding);

        assert_eq!(
            machine.on_credential_request(CAR),
            Some(PinReply::Supply("0000".into()))
        );
        match machine.on_bond_state(CAR, BondState::Bonded) {
            BondOutcome::Bonded(device) => assert!(device.is_bonded()),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(machine.status(), PairingStatus::Success);
        assert!(machine.target().is_none());
    }

    #[test]
    fn test_exhausting_defaults_needs_credential() {
        let mut machine = PairingMachine::new();
        machine.start(car(), default_pins());

        let mut supplied = Vec::new();
        loop {
            if let Some(PinReply::Supply(pin)) = machine.on_credential_request(CAR) {
                supplied.push(pin);
            }
            match machine.on_bond_state(CAR, BondState::None) {
                BondOutcome::Retry(_) => continue,
                BondOutcome::NeedsCredential => break,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(supplied, default_pins());
        assert_eq!(machine.status(), PairingStatus::NeedsCredential);
        assert_eq!(machine.target().map(|d| d.address.as_str()), Some(CAR));
    }

    #[test]
    fn test_success_on_first_pin_stops_attempts() {
        let mut machine = PairingMachine::new();
        machine.start(car(), default_pins());
        machine.on_credential_request(CAR);
        assert!(matches!(
            machine.on_bond_state(CAR, BondState::Bonded),
            BondOutcome::Bonded(_)
        ));
        assert_eq!(machine.on_credential_request(CAR), None);
    }

    #[test]
    fn test_empty_queue_defers_to_platform_prompt() {
        let mut machine = PairingMachine::new();
        machine.start(car(), Vec::<String>::new());
        assert_eq!(machine.on_credential_request(CAR), Some(PinReply::Prompt));
        assert_eq!(machine.status(), PairingStatus::Bonding);
    }

    #[test]
    fn test_foreign_requests_are_ignored() {
        let mut machine = PairingMachine::new();
        machine.start(car(), default_pins());

        assert_eq!(machine.on_credential_request("11:22:33:44:55:66"), None);
        assert_eq!(
            machine.on_bond_state("11:22:33:44:55:66", BondState::None),
            BondOutcome::Unchanged
        );
        // Our queue is untouched
        assert_eq!(
            machine.on_credential_request(CAR),
            Some(PinReply::Supply("1234".into()))
        );
    }

    #[test]
    fn test_failure_without_pin_request_still_bounded() {
        let mut machine = PairingMachine::new();
        machine.start(car(), default_pins());
        assert!(matches!(
            machine.on_bond_state(CAR, BondState::None),
            BondOutcome::Retry(_)
        ));
        assert_eq!(
            machine.on_bond_state(CAR, BondState::None),
            BondOutcome::NeedsCredential
        );
    }

    #[test]
    fn test_provided_credential_is_the_only_candidate() {
        let mut machine = PairingMachine::new();
        machine.start(car(), Vec::<String>::new());
        assert_eq!(machine.on_bond_state(CAR, BondState::None), BondOutcome::NeedsCredential);

        assert_eq!(machine.provide_credential("4321"), Some(car()));
        assert_eq!(machine.status(), PairingStatus::Bonding);
        assert_eq!(
            machine.on_credential_request(CAR),
            Some(PinReply::Supply("4321".into()))
        );
        assert_eq!(machine.on_bond_state(CAR, BondState::None), BondOutcome::NeedsCredential);
    }

    #[test]
    fn test_provide_credential_requires_waiting_state() {
        let mut machine = PairingMachine::new();
        assert_eq!(machine.provide_credential("1234"), None);
        machine.start(car(), default_pins());
        assert_eq!(machine.provide_credential("1234"), None);
    }

    #[test]
    fn test_reset_only_from_settled_states() {
        let mut machine = PairingMachine::new();
        assert!(machine.reset());

        machine.start(car(), default_pins());
        assert!(!machine.reset());
        assert_eq!(machine.status(), PairingStatus::Bonding);

        machine.on_request_error();
        assert_eq!(machine.status(), PairingStatus::Failed);
        assert!(machine.reset());
        assert_eq!(machine.status(), PairingStatus::Idle);
        assert!(machine.target().is_none());
    }
}
