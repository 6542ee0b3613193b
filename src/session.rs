//! Transport session
//!
//! Owns the single physical connection to one peripheral. All operations
//! are gated on the connection status and on the characteristic's
//! capability set; once the status leaves `Connected` every operation is
//! rejected until the reconnection policy establishes a fresh session.
//! A session never reconnects by itself.

use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::ble::link::{BleLink, Characteristic, LinkConnector};
use crate::ble::BleError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection to {address} failed: {reason}")]
    Connection { address: String, reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("characteristic {characteristic:?} does not support {operation}")]
    Unsupported {
        characteristic: Characteristic,
        operation: &'static str,
    },

    #[error(transparent)]
    Transport(#[from] BleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// One active transport session to one peripheral address.
pub struct Session {
    address: String,
    link: Box<dyn BleLink>,
    status: SessionStatus,
}

impl Session {
    /// Establish the physical connection, bounded by `timeout`.
    pub async fn connect(
        connector: &dyn LinkConnector,
        address: &str,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        debug!("connecting to {address}");
        let link = match tokio::time::timeout(timeout, connector.connect(address)).await {
            Err(_) => {
                return Err(SessionError::Connection {
                    address: address.to_string(),
                    reason: format!("timed out after {timeout:?}"),
                })
            }
            Ok(Err(err)) => {
                return Err(SessionError::Connection {
                    address: address.to_string(),
                    reason: err.to_string(),
                })
            }
            Ok(Ok(link)) => link,
        };
        info!("connected to {address}");
        Ok(Self {
            address: address.to_string(),
            link,
            status: SessionStatus::Connected,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> SessionStatus {
        if self.status == SessionStatus::Connected && !self.link.is_connected() {
            SessionStatus::Disconnected
        } else {
            self.status
        }
    }

    /// Negotiated maximum payload per write.
    pub fn mtu(&self) -> usize {
        self.link.mtu()
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.status() == SessionStatus::Connected {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    pub async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, SessionError> {
        self.ensure_connected()?;
        if !characteristic.readable() {
            return Err(SessionError::Unsupported {
                characteristic,
                operation: "read",
            });
        }
        Ok(self.link.read(characteristic).await?)
    }

    pub async fn write(
        &self,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), SessionError> {
        self.ensure_connected()?;
        if !characteristic.writable() {
            return Err(SessionError::Unsupported {
                characteristic,
                operation: "write",
            });
        }
        Ok(self.link.write(characteristic, data).await?)
    }

    /// Subscribe to device-pushed notifications. Packets arrive in
    /// transport order; a receiver that falls behind sees `Lagged`.
    pub fn subscribe(
        &self,
        characteristic: Characteristic,
    ) -> Result<broadcast::Receiver<Vec<u8>>, SessionError> {
        self.ensure_connected()?;
        if !characteristic.notifiable() {
            return Err(SessionError::Unsupported {
                characteristic,
                operation: "subscribe",
            });
        }
        Ok(self.link.notifications(characteristic)?)
    }

    /// Tear down the connection. Idempotent.
    pub async fn disconnect(&mut self) {
        if self.status == SessionStatus::Disconnected {
            return;
        }
        self.status = SessionStatus::Disconnected;
        if let Err(err) = self.link.disconnect().await {
            warn!("disconnect from {} reported {err}", self.address);
        } else {
            info!("disconnected from {}", self.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimFurby, SimFurbyConfig};

    async fn connected_session(furby: &SimFurby) -> Session {
        Session::connect(furby, "sim", Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn connect_then_read() {
        let furby = SimFurby::new(SimFurbyConfig::default());
        let session = connected_session(&furby).await;
        assert_eq!(session.status(), SessionStatus::Connected);
        let model = session.read(Characteristic::ModelNumber).await.unwrap();
        assert_eq!(model, b"Furby Connect");
    }

    #[tokio::test]
    async fn refused_connection_surfaces_as_connection_error() {
        let furby = SimFurby::new(SimFurbyConfig::default());
        furby.refuse_next_connects(1).await;
        let result = Session::connect(&furby, "sim", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::Connection { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connection_times_out() {
        let furby = SimFurby::new(SimFurbyConfig::default());
        furby.set_connect_delay(Duration::from_secs(10)).await;
        let result = Session::connect(&furby, "sim", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::Connection { .. })));
    }

    #[tokio::test]
    async fn capability_checks() {
        let furby = SimFurby::new(SimFurbyConfig::default());
        let session = connected_session(&furby).await;
        assert!(matches!(
            session.read(Characteristic::GeneralPlusWrite).await,
            Err(SessionError::Unsupported { .. })
        ));
        assert!(matches!(
            session.write(Characteristic::ModelNumber, &[0x00]).await,
            Err(SessionError::Unsupported { .. })
        ));
        assert!(matches!(
            session.subscribe(Characteristic::FileWrite),
            Err(SessionError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn operations_rejected_after_disconnect() {
        let furby = SimFurby::new(SimFurbyConfig::default());
        let mut session = connected_session(&furby).await;
        session.disconnect().await;
        session.disconnect().await; // idempotent
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(matches!(
            session.read(Characteristic::ModelNumber).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn link_loss_is_observed_as_disconnected() {
        let furby = SimFurby::new(SimFurbyConfig::default());
        let session = connected_session(&furby).await;
        furby.force_disconnect();
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(matches!(
            session.read(Characteristic::ModelNumber).await,
            Err(SessionError::NotConnected)
        ));
    }
}
