//! BLE transport layer
//!
//! Abstract link traits, the in-process simulated peripheral, and the
//! btleplug-backed central (behind the `ble-central` feature).

#[cfg(feature = "ble-central")]
pub mod central;
pub mod link;
pub mod simulated;

use std::time::Duration;

use log::warn;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::ble::link::Characteristic;

#[derive(Error, Debug)]
pub enum BleError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("not connected")]
    NotConnected,

    #[error("read failed on {characteristic:?}: {reason}")]
    Read {
        characteristic: Characteristic,
        reason: String,
    },

    #[error("write failed on {characteristic:?}: {reason}")]
    Write {
        characteristic: Characteristic,
        reason: String,
    },

    #[error("characteristic {characteristic:?} does not support {operation}")]
    Unsupported {
        characteristic: Characteristic,
        operation: &'static str,
    },

    #[error("peer disconnected")]
    Disconnected,

    #[error("operation timed out")]
    Timeout,
}

/// Wait on a notification stream until a packet matches `pred` or the
/// deadline passes. Lagged packets are skipped with a warning; a closed
/// stream maps to `Disconnected`.
pub(crate) async fn await_notification(
    rx: &mut broadcast::Receiver<Vec<u8>>,
    within: Duration,
    mut pred: impl FnMut(&[u8]) -> bool,
) -> Result<Vec<u8>, BleError> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Err(_) => return Err(BleError::Timeout),
            Ok(Err(broadcast::error::RecvError::Closed)) => return Err(BleError::Disconnected),
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                warn!("notification stream lagged, {n} packets skipped");
            }
            Ok(Ok(packet)) => {
                if pred(&packet) {
                    return Ok(packet);
                }
            }
        }
    }
}
