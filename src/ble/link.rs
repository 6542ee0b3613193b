//! BLE link trait definitions and GATT reference data
//!
//! Defines the abstract link interface that both the simulated peripheral
//! and the btleplug central conform to, plus the characteristic table of
//! the Furby Connect GATT profile.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::BleError;

/// Primary control service exposed by the toy.
pub fn fluff_service_uuid() -> Uuid {
    Uuid::from_u128(0xdab91435_b5a1_e29c_b041_bcd562613bde)
}

/// Standard device-information service.
pub fn device_information_service_uuid() -> Uuid {
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb)
}

/// Named characteristics of the peripheral.
///
/// Read-only reference data: each variant maps to one GATT characteristic
/// with a fixed capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Characteristic {
    ManufacturerName,
    ModelNumber,
    SerialNumber,
    HardwareRevision,
    FirmwareRevision,
    SoftwareRevision,
    GeneralPlusWrite,
    GeneralPlusListen,
    NordicWrite,
    NordicListen,
    RssiListen,
    FileWrite,
}

impl Characteristic {
    /// The six device-information characteristics, in snapshot field order.
    pub const DEVICE_INFO: [Characteristic; 6] = [
        Characteristic::ManufacturerName,
        Characteristic::ModelNumber,
        Characteristic::SerialNumber,
        Characteristic::HardwareRevision,
        Characteristic::FirmwareRevision,
        Characteristic::SoftwareRevision,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Self::ManufacturerName => Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb),
            Self::ModelNumber => Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb),
            Self::SerialNumber => Uuid::from_u128(0x00002a25_0000_1000_8000_00805f9b34fb),
            Self::HardwareRevision => Uuid::from_u128(0x00002a27_0000_1000_8000_00805f9b34fb),
            Self::FirmwareRevision => Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb),
            Self::SoftwareRevision => Uuid::from_u128(0x00002a28_0000_1000_8000_00805f9b34fb),
            Self::GeneralPlusWrite => Uuid::from_u128(0xdab91383_b5a1_e29c_b041_bcd562613bde),
            Self::GeneralPlusListen => Uuid::from_u128(0xdab91382_b5a1_e29c_b041_bcd562613bde),
            Self::NordicWrite => Uuid::from_u128(0xdab90757_b5a1_e29c_b041_bcd562613bde),
            Self::NordicListen => Uuid::from_u128(0xdab90756_b5a1_e29c_b041_bcd562613bde),
            Self::RssiListen => Uuid::from_u128(0xdab90755_b5a1_e29c_b041_bcd562613bde),
            Self::FileWrite => Uuid::from_u128(0xdab90758_b5a1_e29c_b041_bcd562613bde),
        }
    }

    pub fn readable(self) -> bool {
        matches!(
            self,
            Self::ManufacturerName
                | Self::ModelNumber
                | Self::SerialNumber
                | Self::HardwareRevision
                | Self::FirmwareRevision
                | Self::SoftwareRevision
        )
    }

    pub fn writable(self) -> bool {
        matches!(
            self,
            Self::GeneralPlusWrite | Self::NordicWrite | Self::FileWrite
        )
    }

    pub fn notifiable(self) -> bool {
        matches!(
            self,
            Self::GeneralPlusListen | Self::NordicListen | Self::RssiListen
        )
    }
}

/// An active link to the peripheral.
///
/// A link is the raw transport: it carries no session state and performs no
/// capability checks (the `Session` does both). The transport supports
/// pipelined reads, so multiple outstanding `read` calls may be in flight
/// at once; writes that mutate device state must not be interleaved.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Read the current value of a characteristic.
    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, BleError>;

    /// Write a packet to a characteristic.
    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), BleError>;

    /// Subscribe to device-pushed notifications for a characteristic.
    /// Packets are delivered in the order received from the transport.
    fn notifications(
        &self,
        characteristic: Characteristic,
    ) -> Result<broadcast::Receiver<Vec<u8>>, BleError>;

    /// Tear down the physical connection.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Whether the physical connection is still up.
    fn is_connected(&self) -> bool;

    /// Negotiated maximum payload per write.
    fn mtu(&self) -> usize;
}

/// Factory for links. The reconnection policy calls this again after a
/// connection loss; links themselves never reconnect.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn BleLink>, BleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_sets_are_disjoint() {
        for ch in [
            Characteristic::ManufacturerName,
            Characteristic::ModelNumber,
            Characteristic::SerialNumber,
            Characteristic::HardwareRevision,
            Characteristic::FirmwareRevision,
            Characteristic::SoftwareRevision,
            Characteristic::GeneralPlusWrite,
            Characteristic::GeneralPlusListen,
            Characteristic::NordicWrite,
            Characteristic::NordicListen,
            Characteristic::RssiListen,
            Characteristic::FileWrite,
        ] {
            let caps = [ch.readable(), ch.writable(), ch.notifiable()];
            assert_eq!(
                caps.iter().filter(|&&c| c).count(),
                1,
                "{ch:?} must have exactly one capability"
            );
        }
    }

    #[test]
    fn device_info_characteristics_are_readable() {
        for ch in Characteristic::DEVICE_INFO {
            assert!(ch.readable());
        }
    }

    #[test]
    fn uuids_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for ch in [
            Characteristic::ManufacturerName,
            Characteristic::GeneralPlusWrite,
            Characteristic::GeneralPlusListen,
            Characteristic::NordicWrite,
            Characteristic::NordicListen,
            Characteristic::RssiListen,
            Characteristic::FileWrite,
        ] {
            assert!(seen.insert(ch.uuid()));
        }
    }
}
