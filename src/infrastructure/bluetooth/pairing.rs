//! Pairing Driver
//!
//! Carries out the decisions of [`PairingMachine`] against the transport.
//! Each attempt owns one bond-event subscription for its whole lifetime;
//! superseding or resetting the attempt drops it.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::models::{Device, PairingStatus, PinReply};
use crate::domain::pairing::{BondOutcome, PairingMachine};
use crate::domain::state::CarState;
use crate::infrastructure::bluetooth::transport::{BondEvent, Transport, TransportError};

type SharedMachine = Arc<Mutex<PairingMachine>>;

fn lock(machine: &Mutex<PairingMachine>) -> MutexGuard<'_, PairingMachine> {
    machine.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct AttemptTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Pairer<T: Transport> {
    transport: Arc<T>,
    state: Arc<CarState>,
    machine: SharedMachine,
    attempt: Option<AttemptTask>,
    bonded: mpsc::UnboundedSender<Device>,
}

impl<T: Transport> Pairer<T> {
    /// `bonded` receives every device whose bonding completed
    pub fn new(
        transport: Arc<T>,
        state: Arc<CarState>,
        bonded: mpsc::UnboundedSender<Device>,
    ) -> Self {
        Self {
            transport,
            state,
            machine: SharedMachine::default(),
            attempt: None,
            bonded,
        }
    }

    pub fn status(&self) -> PairingStatus {
        lock(&self.machine).status()
    }

    pub fn target(&self) -> Option<Device> {
        lock(&self.machine).target().cloned()
    }

    /// Start bonding with `device`, trying `pins` in order.
    /// Any attempt for another device is cancelled first.
    pub async fn pair(&mut self, device: Device, pins: Vec<String>) -> bool {
        if lock(&self.machine).is_bonding_with(&device.address) {
            debug!("Already bonding with {}", device.address);
            return true;
        }

        self.cancel_attempt().await;
        info!("Pairing with {} ({})", device.address, device.display_name());
        {
            let mut machine = lock(&self.machine);
            machine.start(device.clone(), pins);
            self.state.pairing_status.set(machine.status());
        }
        self.begin(device).await
    }

    /// Retry the retained device with an operator-supplied PIN
    pub async fn provide_credential(&mut self, pin: &str) -> bool {
        if self.status() != PairingStatus::NeedsCredential {
            debug!("No pairing attempt is waiting for a PIN");
            return false;
        }

        self.cancel_attempt().await;
        let target = {
            let mut machine = lock(&self.machine);
            let target = machine.provide_credential(pin);
            self.state.pairing_status.set(machine.status());
            target
        };
        match target {
            Some(device) => self.begin(device).await,
            None => false,
        }
    }

    /// Back to `Idle` from a settled state
    pub async fn reset(&mut self) -> bool {
        let reset = {
            let mut machine = lock(&self.machine);
            let reset = machine.reset();
            if reset {
                self.state.pairing_status.set(machine.status());
            }
            reset
        };
        if reset {
            self.cancel_attempt().await;
        } else {
            debug!("Pairing reset refused while bonding is in flight");
        }
        reset
    }

    /// Drop whatever attempt is live, whatever its state
    pub async fn abandon(&mut self) {
        self.cancel_attempt().await;
        let mut machine = lock(&self.machine);
        machine.abandon();
        self.state.pairing_status.set(machine.status());
    }

    async fn begin(&mut self, device: Device) -> bool {
        // Subscribe before asking so no notification slips past
        let events = self.transport.bond_events();

        if let Err(e) = request_bond(&self.transport, &device.address).await {
            warn!("Bond request for {} failed: {}", device.address, e);
            fail(&self.machine, &self.state);
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(drive_attempt(
            self.transport.clone(),
            self.machine.clone(),
            self.state.clone(),
            events,
            cancel.clone(),
            self.bonded.clone(),
        ));
        self.attempt = Some(AttemptTask { cancel, task });
        true
    }

    async fn cancel_attempt(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.cancel.cancel();
            let _ = attempt.task.await;
        }
    }
}

async fn request_bond<T: Transport>(transport: &Arc<T>, address: &str) -> Result<(), TransportError> {
    let transport = transport.clone();
    let address = address.to_string();
    tokio::task::spawn_blocking(move || transport.create_bond(&address))
        .await
        .unwrap_or_else(|e| Err(TransportError::Platform(e.to_string())))
}

fn fail(machine: &Mutex<PairingMachine>, state: &CarState) {
    let mut machine = lock(machine);
    machine.on_request_error();
    state.pairing_status.set(machine.status());
}

async fn drive_attempt<T: Transport>(
    transport: Arc<T>,
    machine: SharedMachine,
    state: Arc<CarState>,
    mut events: mpsc::UnboundedReceiver<BondEvent>,
    cancel: CancellationToken,
    bonded: mpsc::UnboundedSender<Device>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            BondEvent::PinRequested { address, reply } => {
                let answer = lock(&machine).on_credential_request(&address);
                match answer {
                    Some(PinReply::Supply(pin)) => {
                        info!("Supplying queued PIN to {}", address);
                        let _ = reply.send(PinReply::Supply(pin));
                    }
                    Some(PinReply::Prompt) => {
                        info!("No PIN left for {}, deferring to the platform prompt", address);
                        let _ = reply.send(PinReply::Prompt);
                    }
                    None => debug!("Ignoring PIN request for foreign device {}", address),
                }
            }
            BondEvent::StateChanged {
                address,
                state: bond_state,
            } => {
                let outcome = {
                    let mut machine = lock(&machine);
                    let outcome = machine.on_bond_state(&address, bond_state);
                    if outcome != BondOutcome::Unchanged {
                        state.pairing_status.set(machine.status());
                    }
                    outcome
                };

                match outcome {
                    BondOutcome::Unchanged => {}
                    BondOutcome::Retry(device) => {
                        info!("Bonding with {} failed, retrying with next PIN", device.address);
                        if let Err(e) = request_bond(&transport, &device.address).await {
                            warn!("Bond retry for {} failed: {}", device.address, e);
                            fail(&machine, &state);
                            break;
                        }
                    }
                    BondOutcome::Bonded(device) => {
                        info!("Bonded with {}", device.address);
                        let _ = bonded.send(device);
                        break;
                    }
                    BondOutcome::NeedsCredential => {
                        info!("Every queued PIN was rejected by {}", address);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::BondState;
    use crate::infrastructure::bluetooth::simulated::{RadioCall, SimulatedCar, SimulatedRadio};
    use std::time::Duration;

    const CAR: &str = "AA:BB:CC:DD:EE:FF";

    struct Fixture {
        radio: SimulatedRadio,
        state: Arc<CarState>,
        pairer: Pairer<SimulatedRadio>,
        bonded: mpsc::UnboundedReceiver<Device>,
    }

    fn fixture(cars: Vec<SimulatedCar>) -> Fixture {
        let radio = SimulatedRadio::new(cars);
        let state = Arc::new(CarState::new(true));
        let (tx, bonded) = mpsc::unbounded_channel();
        let pairer = Pairer::new(Arc::new(radio.clone()), state.clone(), tx);
        Fixture {
            radio,
            state,
            pairer,
            bonded,
        }
    }

    fn car() -> Device {
        Device::new(CAR, Some("Car"), BondState::None)
    }

    fn pins() -> Vec<String> {
        vec!["1234".into(), "0000".into()]
    }

    async fn wait_for(rx: &mut mpsc::UnboundedReceiver<PairingStatus>, want: PairingStatus) -> Vec<PairingStatus> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(status) = rx.recv().await {
                seen.push(status);
                if status == want {
                    break;
                }
            }
        })
        .await
        .expect("pairing status never arrived");
        seen
    }

    fn bond_requests(radio: &SimulatedRadio) -> usize {
        radio
            .calls()
            .iter()
            .filter(|c| matches!(c, RadioCall::CreateBond(_)))
            .count()
    }

    #[tokio::test]
    async fn test_second_default_pin_bonds() {
        let mut f = fixture(vec![SimulatedCar::new(CAR, Some("Car")).with_pin(Some("0000"))]);
        let mut statuses = f.state.pairing_status.subscribe();

        assert!(f.pairer.pair(car(), pins()).await);
        let seen = wait_for(&mut statuses, PairingStatus::Success).await;

        assert_eq!(
            seen,
            vec![
                PairingStatus::Idle,
                PairingStatus::Bonding,
                PairingStatus::Bonding,
                PairingStatus::Success,
            ]
        );
        let bonded = f.bonded.recv().await.unwrap();
        assert_eq!(bonded.address, CAR);
        assert!(bonded.is_bonded());
        assert_eq!(bond_requests(&f.radio), 2);
    }

    #[tokio::test]
    async fn test_first_pin_success_stops_attempts() {
        let mut f = fixture(vec![SimulatedCar::new(CAR, Some("Car")).with_pin(Some("1234"))]);
        let mut statuses = f.state.pairing_status.subscribe();

        f.pairer.pair(car(), pins()).await;
        wait_for(&mut statuses, PairingStatus::Success).await;
        assert_eq!(bond_requests(&f.radio), 1);
    }

    #[tokio::test]
    async fn test_exhausted_queue_waits_for_operator_pin() {
        let mut f = fixture(vec![SimulatedCar::new(CAR, Some("Car")).with_pin(Some("8765"))]);
        let mut statuses = f.state.pairing_status.subscribe();

        f.pairer.pair(car(), pins()).await;
        wait_for(&mut statuses, PairingStatus::NeedsCredential).await;
        assert_eq!(bond_requests(&f.radio), 2);
        assert_eq!(f.pairer.target().map(|d| d.address), Some(CAR.to_string()));

        assert!(f.pairer.provide_credential("8765").await);
        wait_for(&mut statuses, PairingStatus::Success).await;
        assert_eq!(f.bonded.recv().await.map(|d| d.address), Some(CAR.to_string()));
    }

    #[tokio::test]
    async fn test_request_error_fails_then_resets() {
        let mut f = fixture(vec![SimulatedCar::new(CAR, Some("Car"))]);
        f.radio.fail_bond_requests(true);

        assert!(!f.pairer.pair(car(), pins()).await);
        assert_eq!(f.state.pairing_status.get(), PairingStatus::Failed);

        assert!(f.pairer.reset().await);
        assert_eq!(f.state.pairing_status.get(), PairingStatus::Idle);
        assert!(f.pairer.target().is_none());
    }

    #[tokio::test]
    async fn test_retry_request_error_fails() {
        let mut f = fixture(vec![SimulatedCar::new(CAR, Some("Car")).with_pin(Some("0000"))]);
        let mut statuses = f.state.pairing_status.subscribe();

        assert!(f.pairer.pair(car(), pins()).await);
        // The car rejects "1234"; the follow-up bond request cannot be issued
        f.radio.fail_bond_requests(true);
        let seen = wait_for(&mut statuses, PairingStatus::Failed).await;

        assert_eq!(
            seen,
            vec![
                PairingStatus::Idle,
                PairingStatus::Bonding,
                PairingStatus::Bonding,
                PairingStatus::Failed,
            ]
        );
        assert_eq!(bond_requests(&f.radio), 2);
        assert!(f.bonded.try_recv().is_err());

        assert!(f.pairer.reset().await);
        assert_eq!(f.state.pairing_status.get(), PairingStatus::Idle);
        assert!(f.pairer.target().is_none());
    }

    #[tokio::test]
    async fn test_foreign_pin_request_is_left_alone() {
        let mut f = fixture(vec![SimulatedCar::new(CAR, Some("Car"))]);
        // No queued PINs: our own request goes to the platform prompt and
        // the attempt stays in flight
        f.pairer.pair(car(), Vec::new()).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.radio.prompted().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let mut replies = f.radio.request_pin("11:22:33:44:55:66");
        assert_eq!(replies.len(), 1);
        let reply = replies.remove(0);
        let answer = tokio::time::timeout(Duration::from_secs(2), reply).await.unwrap();
        assert!(answer.is_err(), "foreign request must not be answered");
        assert_eq!(f.state.pairing_status.get(), PairingStatus::Bonding);
        assert!(!f.pairer.reset().await);
    }

    #[tokio::test]
    async fn test_new_pair_supersedes_previous_subscription() {
        let mut f = fixture(vec![
            SimulatedCar::new(CAR, Some("Car")),
            SimulatedCar::new("11:22:33:44:55:66", Some("Other")),
        ]);
        f.pairer.pair(car(), Vec::new()).await;
        assert_eq!(f.radio.bond_subscribers(), 1);

        f.pairer
            .pair(Device::new("11:22:33:44:55:66", Some("Other"), BondState::None), Vec::new())
            .await;
        assert_eq!(f.radio.bond_subscribers(), 1);
        assert_eq!(
            f.pairer.target().map(|d| d.address),
            Some("11:22:33:44:55:66".to_string())
        );
    }
}
