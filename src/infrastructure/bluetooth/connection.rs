//! Serial Connection Module
//!
//! Owns the single exclusive serial session to the car.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};
use uuid::Uuid;

use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{SerialStream, Transport, TransportError};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service record the car's receiver listens on
    pub service_uuid: Uuid,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::serial_port_service_uuid(),
        }
    }
}

type SharedStream = Arc<Mutex<Box<dyn SerialStream>>>;

fn lock_stream(stream: &Mutex<Box<dyn SerialStream>>) -> MutexGuard<'_, Box<dyn SerialStream>> {
    stream.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Open stream plus the device it belongs to
struct SerialSession {
    address: String,
    stream: SharedStream,
}

pub struct Connection<T: Transport> {
    transport: Arc<T>,
    config: ConnectionConfig,
    session: Option<SerialSession>,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: Arc<T>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            config,
            session: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Address of the connected device
    pub fn address(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.address.as_str())
    }

    /// Open a session to `address`, closing any prior one first
    pub async fn open(&mut self, address: &str) -> Result<(), TransportError> {
        if self.session.is_some() {
            self.close().await;
        }

        info!("Opening serial session to {}", address);
        let transport = self.transport.clone();
        let target = address.to_string();
        let service = self.config.service_uuid;
        let stream = tokio::task::spawn_blocking(move || transport.open_stream(&target, service))
            .await
            .unwrap_or_else(|e| Err(TransportError::Platform(e.to_string())))?;

        self.session = Some(SerialSession {
            address: address.to_string(),
            stream: Arc::new(Mutex::new(stream)),
        });
        info!("Serial session to {} established", address);
        Ok(())
    }

    /// Close the writer, then the stream. Returns false without a session.
    ///
    /// Both steps are attempted and the session is dropped even if they fail.
    pub async fn close(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };

        let address = session.address.clone();
        let stream = session.stream;
        let closed = tokio::task::spawn_blocking(move || {
            let mut stream = lock_stream(&stream);
            if let Err(e) = stream.close_output() {
                warn!("Failed to close output stream: {}", e);
            }
            if let Err(e) = stream.close() {
                warn!("Failed to close serial stream: {}", e);
            }
        })
        .await;
        if let Err(e) = closed {
            warn!("Serial close task failed: {}", e);
        }

        info!("Serial session to {} closed", address);
        true
    }

    pub async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;
        let stream = session.stream.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || lock_stream(&stream).write(&bytes))
            .await
            .unwrap_or_else(|e| Err(TransportError::Platform(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulated::{RadioCall, SimulatedCar, SimulatedRadio};

    const CAR: &str = "98:D3:31:F5:A1:07";
    const OTHER: &str = "00:21:13:00:4B:9C";

    fn connection(radio: &SimulatedRadio) -> Connection<SimulatedRadio> {
        Connection::new(Arc::new(radio.clone()), ConnectionConfig::default())
    }

    fn radio() -> SimulatedRadio {
        SimulatedRadio::new(vec![
            SimulatedCar::new(CAR, Some("HC-05")).bonded(),
            SimulatedCar::new(OTHER, Some("Other")).bonded(),
        ])
    }

    #[tokio::test]
    async fn test_open_write_close() {
        let radio = radio();
        let mut conn = connection(&radio);

        conn.open(CAR).await.unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.address(), Some(CAR));

        conn.write(b"F").await.unwrap();
        assert_eq!(radio.written_to(CAR), "F");

        assert!(conn.close().await);
        assert!(!conn.is_open());
        assert_eq!(radio.open_streams(), 0);

        let calls = radio.calls();
        let n = calls.len();
        assert_eq!(
            &calls[n - 2..],
            &[
                RadioCall::CloseOutput(CAR.to_string()),
                RadioCall::CloseStream(CAR.to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_reopen_closes_prior_session() {
        let radio = radio();
        let mut conn = connection(&radio);

        conn.open(CAR).await.unwrap();
        conn.open(OTHER).await.unwrap();

        assert_eq!(conn.address(), Some(OTHER));
        assert_eq!(radio.open_streams(), 1);
        let calls = radio.calls();
        let closed = calls
            .iter()
            .position(|c| *c == RadioCall::CloseStream(CAR.to_string()))
            .unwrap();
        let reopened = calls
            .iter()
            .position(|c| *c == RadioCall::OpenStream(OTHER.to_string()))
            .unwrap();
        assert!(closed < reopened);
    }

    #[tokio::test]
    async fn test_close_without_session() {
        let radio = radio();
        let mut conn = connection(&radio);
        assert!(!conn.close().await);
        assert!(radio.calls().is_empty());
    }

    #[tokio::test]
    async fn test_close_failure_still_releases() {
        let radio = radio();
        let mut conn = connection(&radio);
        conn.open(CAR).await.unwrap();
        radio.fail_close(true);

        assert!(conn.close().await);
        assert!(!conn.is_open());
        assert_eq!(radio.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_write_without_session() {
        let radio = radio();
        let conn = connection(&radio);
        assert!(matches!(
            conn.write(b"F").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_missing_service() {
        let radio = SimulatedRadio::new(vec![SimulatedCar::new(CAR, None).without_serial()]);
        let mut conn = connection(&radio);

        assert!(matches!(
            conn.open(CAR).await,
            Err(TransportError::ServiceNotFound(_))
        ));
        assert!(!conn.is_open());
        assert_eq!(radio.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_security_denial() {
        let radio = radio();
        radio.deny_streams(true);
        let mut conn = connection(&radio);

        assert!(matches!(
            conn.open(CAR).await,
            Err(TransportError::PermissionDenied)
        ));
        assert!(!conn.is_open());
        assert_eq!(radio.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_unknown_address() {
        let radio = radio();
        let mut conn = connection(&radio);
        assert!(matches!(
            conn.open("FF:FF:FF:FF:FF:FF").await,
            Err(TransportError::UnknownDevice(_))
        ));
    }
}
