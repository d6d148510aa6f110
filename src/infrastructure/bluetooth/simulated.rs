//! Simulated Radio
//!
//! In-memory [`Transport`] used by the console binary and the test suites.
//! It models the parts of a classic Bluetooth adapter the core relies on:
//! discovery notifications, PIN-based bonding that fails on a wrong PIN,
//! and a single exclusive serial stream per adapter.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::domain::models::{BondState, Device, PinReply};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    BondEvent, DiscoveryEvent, SerialStream, Transport, TransportError,
};

/// Calls the core made on the radio, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartDiscovery,
    StopDiscovery,
    CreateBond(String),
    OpenStream(String),
    CloseOutput(String),
    CloseStream(String),
}

/// A remote device within range of the simulated adapter
#[derive(Debug, Clone)]
pub struct SimulatedCar {
    pub address: String,
    pub name: Option<String>,
    /// PIN the car expects; `None` bonds without one
    pub pin: Option<String>,
    pub bonded: bool,
    pub offers_serial: bool,
}

impl SimulatedCar {
    pub fn new(address: &str, name: Option<&str>) -> Self {
        Self {
            address: address.to_string(),
            name: name.map(str::to_string),
            pin: Some("1234".to_string()),
            bonded: false,
            offers_serial: true,
        }
    }

    pub fn with_pin(mut self, pin: Option<&str>) -> Self {
        self.pin = pin.map(str::to_string);
        self
    }

    pub fn bonded(mut self) -> Self {
        self.bonded = true;
        self
    }

    pub fn without_serial(mut self) -> Self {
        self.offers_serial = false;
        self
    }

    fn device(&self) -> Device {
        Device {
            address: self.address.clone(),
            name: self.name.clone(),
            bond_state: if self.bonded {
                BondState::Bonded
            } else {
                BondState::None
            },
        }
    }
}

#[derive(Default)]
struct Radio {
    enabled: bool,
    cars: Vec<SimulatedCar>,
    discovery: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
    bond_subscribers: Vec<mpsc::UnboundedSender<BondEvent>>,
    calls: Vec<RadioCall>,
    written: Vec<(String, u8)>,
    open_streams: usize,
    prompted: Vec<String>,
    fail_bond_requests: bool,
    fail_writes: bool,
    fail_close: bool,
    deny_streams: bool,
}

impl Radio {
    fn car_mut(&mut self, address: &str) -> Option<&mut SimulatedCar> {
        self.cars.iter_mut().find(|c| c.address == address)
    }

    fn broadcast_bond_state(&mut self, address: &str, state: BondState) {
        self.bond_subscribers.retain(|subscriber| {
            subscriber
                .send(BondEvent::StateChanged {
                    address: address.to_string(),
                    state,
                })
                .is_ok()
        });
    }

    fn request_pin(&mut self, address: &str) -> Vec<oneshot::Receiver<PinReply>> {
        let mut replies = Vec::new();
        self.bond_subscribers.retain(|subscriber| {
            let (reply, answer) = oneshot::channel();
            let sent = subscriber
                .send(BondEvent::PinRequested {
                    address: address.to_string(),
                    reply,
                })
                .is_ok();
            if sent {
                replies.push(answer);
            }
            sent
        });
        replies
    }
}

#[derive(Clone)]
pub struct SimulatedRadio {
    radio: Arc<Mutex<Radio>>,
}

fn lock(radio: &Mutex<Radio>) -> MutexGuard<'_, Radio> {
    radio.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedRadio {
    pub fn new(cars: Vec<SimulatedCar>) -> Self {
        Self {
            radio: Arc::new(Mutex::new(Radio {
                enabled: true,
                cars,
                ..Radio::default()
            })),
        }
    }

    /// A small neighbourhood for the console: one HC-05 style car, one car
    /// that is already bonded and a nameless gadget
    pub fn demo() -> Self {
        Self::new(vec![
            SimulatedCar::new("98:D3:31:F5:A1:07", Some("HC-05")).with_pin(Some("1234")),
            SimulatedCar::new("00:21:13:00:4B:9C", Some("Garage Car"))
                .with_pin(None)
                .bonded(),
            SimulatedCar::new("5C:F3:70:8A:11:02", None).without_serial(),
        ])
    }

    fn lock(&self) -> MutexGuard<'_, Radio> {
        lock(&self.radio)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    /// Refuse stream access as a platform without the connect permission would
    pub fn deny_streams(&self, deny: bool) {
        self.lock().deny_streams = deny;
    }

    pub fn fail_bond_requests(&self, fail: bool) {
        self.lock().fail_bond_requests = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.lock().fail_close = fail;
    }

    /// Deliver a discovery notification if discovery is running
    pub fn announce(&self, device: Device) -> bool {
        let radio = self.lock();
        match &radio.discovery {
            Some(events) => events.send(DiscoveryEvent::DeviceFound(device)).is_ok(),
            None => false,
        }
    }

    pub fn announce_name(&self, address: &str, name: &str) -> bool {
        let radio = self.lock();
        match &radio.discovery {
            Some(events) => events
                .send(DiscoveryEvent::NameChanged {
                    address: address.to_string(),
                    name: name.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Raise a PIN request as another application's bonding flow would
    pub fn request_pin(&self, address: &str) -> Vec<oneshot::Receiver<PinReply>> {
        self.lock().request_pin(address)
    }

    pub fn is_discovering(&self) -> bool {
        self.lock().discovery.is_some()
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.lock().calls.clone()
    }

    /// Every byte written to `address`, as text
    pub fn written_to(&self, address: &str) -> String {
        self.lock()
            .written
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, b)| *b as char)
            .collect()
    }

    pub fn open_streams(&self) -> usize {
        self.lock().open_streams
    }

    /// Addresses whose bonding fell back to the platform prompt
    pub fn prompted(&self) -> Vec<String> {
        self.lock().prompted.clone()
    }

    pub fn bond_subscribers(&self) -> usize {
        let mut radio = self.lock();
        radio.bond_subscribers.retain(|s| !s.is_closed());
        radio.bond_subscribers.len()
    }
}

async fn run_bonding(radio: Arc<Mutex<Radio>>, address: String, expected: Option<String>) {
    lock(&radio).broadcast_bond_state(&address, BondState::Bonding);

    let Some(expected) = expected else {
        let mut radio = lock(&radio);
        if let Some(car) = radio.car_mut(&address) {
            car.bonded = true;
        }
        radio.broadcast_bond_state(&address, BondState::Bonded);
        return;
    };

    let replies = lock(&radio).request_pin(&address);
    let mut supplied = None;
    for answer in replies {
        if let Ok(PinReply::Supply(pin)) = answer.await {
            supplied = Some(pin);
            break;
        }
    }

    let mut radio = lock(&radio);
    match supplied {
        Some(pin) if pin == expected => {
            debug!("Simulated bond with {} accepted PIN", address);
            if let Some(car) = radio.car_mut(&address) {
                car.bonded = true;
            }
            radio.broadcast_bond_state(&address, BondState::Bonded);
        }
        Some(_) => {
            debug!("Simulated bond with {} rejected PIN", address);
            radio.broadcast_bond_state(&address, BondState::None);
        }
        None => {
            // The platform dialog owns the flow from here on
            radio.prompted.push(address);
        }
    }
}

impl Transport for SimulatedRadio {
    fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    fn bonded_devices(&self) -> Result<Vec<Device>, TransportError> {
        let radio = self.lock();
        if !radio.enabled {
            return Err(TransportError::RadioOff);
        }
        Ok(radio
            .cars
            .iter()
            .filter(|c| c.bonded)
            .map(SimulatedCar::device)
            .collect())
    }

    fn start_discovery(
        &self,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<(), TransportError> {
        let mut radio = self.lock();
        radio.calls.push(RadioCall::StartDiscovery);
        if !radio.enabled {
            return Err(TransportError::RadioOff);
        }
        for car in &radio.cars {
            let _ = events.send(DiscoveryEvent::DeviceFound(car.device()));
        }
        radio.discovery = Some(events);
        Ok(())
    }

    fn stop_discovery(&self) -> Result<(), TransportError> {
        let mut radio = self.lock();
        radio.calls.push(RadioCall::StopDiscovery);
        radio.discovery = None;
        Ok(())
    }

    fn bond_events(&self) -> mpsc::UnboundedReceiver<BondEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().bond_subscribers.push(tx);
        rx
    }

    fn create_bond(&self, address: &str) -> Result<(), TransportError> {
        let mut radio = self.lock();
        radio.calls.push(RadioCall::CreateBond(address.to_string()));
        if !radio.enabled {
            return Err(TransportError::RadioOff);
        }
        if radio.fail_bond_requests {
            return Err(TransportError::Platform("bond request rejected".into()));
        }
        let car = radio
            .car_mut(address)
            .ok_or_else(|| TransportError::UnknownDevice(address.to_string()))?;
        let expected = car.pin.clone();
        drop(radio);

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Platform(e.to_string()))?;
        runtime.spawn(run_bonding(self.radio.clone(), address.to_string(), expected));
        Ok(())
    }

    fn open_stream(
        &self,
        address: &str,
        service: Uuid,
    ) -> Result<Box<dyn SerialStream>, TransportError> {
        let mut radio = self.lock();
        radio.calls.push(RadioCall::OpenStream(address.to_string()));
        if !radio.enabled {
            return Err(TransportError::RadioOff);
        }
        if radio.deny_streams {
            return Err(TransportError::PermissionDenied);
        }
        let car = radio
            .car_mut(address)
            .ok_or_else(|| TransportError::UnknownDevice(address.to_string()))?;
        if !car.offers_serial || service != protocol::serial_port_service_uuid() {
            return Err(TransportError::ServiceNotFound(service));
        }
        if radio.open_streams > 0 {
            return Err(TransportError::Platform(
                "the serial channel is already in use".into(),
            ));
        }
        radio.open_streams += 1;

        Ok(Box::new(SimulatedStream {
            address: address.to_string(),
            radio: self.radio.clone(),
            output_open: true,
            open: true,
        }))
    }
}

struct SimulatedStream {
    address: String,
    radio: Arc<Mutex<Radio>>,
    output_open: bool,
    open: bool,
}

impl SimulatedStream {
    fn release(&mut self, radio: &mut Radio) {
        if self.open {
            self.open = false;
            radio.open_streams = radio.open_streams.saturating_sub(1);
        }
    }
}

impl SerialStream for SimulatedStream {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.output_open {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
        }
        let mut radio = lock(&self.radio);
        if radio.fail_writes {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into());
        }
        for byte in bytes {
            radio.written.push((self.address.clone(), *byte));
        }
        Ok(())
    }

    fn close_output(&mut self) -> Result<(), TransportError> {
        self.output_open = false;
        let mut radio = lock(&self.radio);
        radio.calls.push(RadioCall::CloseOutput(self.address.clone()));
        if radio.fail_close {
            return Err(std::io::Error::from(std::io::ErrorKind::Other).into());
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let radio = self.radio.clone();
        let mut radio = lock(&radio);
        radio.calls.push(RadioCall::CloseStream(self.address.clone()));
        self.release(&mut radio);
        Ok(())
    }
}

impl Drop for SimulatedStream {
    fn drop(&mut self) {
        let radio = self.radio.clone();
        let mut radio = lock(&radio);
        self.release(&mut radio);
    }
}
