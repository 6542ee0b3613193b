//! Parallel device-information reader

use futures_util::future::try_join_all;
use log::debug;
use serde::Serialize;

use crate::ble::link::Characteristic;
use crate::session::{Session, SessionError};

/// Immutable snapshot of the six standard device-information fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model_number: String,
    pub serial_number: String,
    pub hardware_revision: String,
    pub firmware_revision: String,
    pub software_revision: String,
}

fn field(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches('\0')
        .to_string()
}

/// Read all six characteristics concurrently; the transport pipelines
/// reads, so wall-clock cost is bounded by the slowest single read. Any
/// individual failure fails the whole snapshot; a partially filled
/// snapshot is never returned.
pub async fn read_device_info(session: &Session) -> Result<DeviceInfo, SessionError> {
    let values = try_join_all(
        Characteristic::DEVICE_INFO
            .iter()
            .map(|&ch| session.read(ch)),
    )
    .await?;
    let info = DeviceInfo {
        manufacturer: field(&values[0]),
        model_number: field(&values[1]),
        serial_number: field(&values[2]),
        hardware_revision: field(&values[3]),
        firmware_revision: field(&values[4]),
        software_revision: field(&values[5]),
    };
    debug!("device info: {info:?}");
    Ok(info)
}
