//! btleplug-backed BLE central
//!
//! Real-hardware implementation of the link traits. Scans for the toy's
//! control service, connects, resolves the characteristic table by UUID,
//! and routes device notifications into per-characteristic broadcast
//! channels so the rest of the bridge is transport-agnostic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::broadcast;

use super::link::{fluff_service_uuid, BleLink, Characteristic, LinkConnector};
use super::BleError;
use crate::protocol;

const SCAN_POLL: Duration = Duration::from_millis(200);

fn connection_err(err: btleplug::Error) -> BleError {
    BleError::Connection(err.to_string())
}

pub struct BtCentral {
    adapter: Adapter,
    scan_timeout: Duration,
}

impl BtCentral {
    /// Open the first available adapter.
    pub async fn new(scan_timeout: Duration) -> Result<Self, BleError> {
        let manager = Manager::new().await.map_err(connection_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(connection_err)?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::Connection("no bluetooth adapter found".into()))?;
        Ok(Self {
            adapter,
            scan_timeout,
        })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, BleError> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![fluff_service_uuid()],
            })
            .await
            .map_err(connection_err)?;
        let deadline = tokio::time::Instant::now() + self.scan_timeout;
        let found = 'search: loop {
            for peripheral in self.adapter.peripherals().await.map_err(connection_err)? {
                if peripheral
                    .address()
                    .to_string()
                    .eq_ignore_ascii_case(address)
                {
                    break 'search peripheral;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = self.adapter.stop_scan().await;
                return Err(BleError::Connection(format!(
                    "peripheral {address} not found within {:?}",
                    self.scan_timeout
                )));
            }
            tokio::time::sleep(SCAN_POLL).await;
        };
        let _ = self.adapter.stop_scan().await;
        Ok(found)
    }
}

#[async_trait]
impl LinkConnector for BtCentral {
    async fn connect(&self, address: &str) -> Result<Box<dyn BleLink>, BleError> {
        let peripheral = self.find_peripheral(address).await?;
        peripheral.connect().await.map_err(connection_err)?;
        peripheral
            .discover_services()
            .await
            .map_err(connection_err)?;

        let mut table = HashMap::new();
        for gatt in peripheral.characteristics() {
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
                if gatt.uuid == ch.uuid() {
                    table.insert(ch, gatt.clone());
                }
            }
        }
        debug!("resolved {} characteristics on {address}", table.len());

        for ch in [
            Characteristic::GeneralPlusListen,
            Characteristic::NordicListen,
            Characteristic::RssiListen,
        ] {
            if let Some(gatt) = table.get(&ch) {
                peripheral.subscribe(gatt).await.map_err(connection_err)?;
            }
        }

        let (gp_tx, _) = broadcast::channel(1024);
        let (nordic_tx, _) = broadcast::channel(1024);
        let (rssi_tx, _) = broadcast::channel(64);
        let connected = Arc::new(AtomicBool::new(true));

        let mut stream = peripheral
            .notifications()
            .await
            .map_err(connection_err)?;
        {
            let gp_tx = gp_tx.clone();
            let nordic_tx = nordic_tx.clone();
            let rssi_tx = rssi_tx.clone();
            let connected = Arc::clone(&connected);
            tokio::spawn(async move {
                while let Some(notification) = stream.next().await {
                    let tx = if notification.uuid == Characteristic::GeneralPlusListen.uuid() {
                        &gp_tx
                    } else if notification.uuid == Characteristic::NordicListen.uuid() {
                        &nordic_tx
                    } else if notification.uuid == Characteristic::RssiListen.uuid() {
                        &rssi_tx
                    } else {
                        continue;
                    };
                    let _ = tx.send(notification.value);
                }
                connected.store(false, Ordering::SeqCst);
                warn!("notification stream ended");
            });
        }

        info!("connected to {address}");
        Ok(Box::new(BtLink {
            peripheral,
            table,
            gp_tx,
            nordic_tx,
            rssi_tx,
            connected,
        }))
    }
}

pub struct BtLink {
    peripheral: Peripheral,
    table: HashMap<Characteristic, btleplug::api::Characteristic>,
    gp_tx: broadcast::Sender<Vec<u8>>,
    nordic_tx: broadcast::Sender<Vec<u8>>,
    rssi_tx: broadcast::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl BtLink {
    fn gatt(&self, ch: Characteristic) -> Result<&btleplug::api::Characteristic, BleError> {
        self.table.get(&ch).ok_or(BleError::Unsupported {
            characteristic: ch,
            operation: "lookup",
        })
    }
}

#[async_trait]
impl BleLink for BtLink {
    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        let gatt = self.gatt(characteristic)?;
        self.peripheral
            .read(gatt)
            .await
            .map_err(|err| BleError::Read {
                characteristic,
                reason: err.to_string(),
            })
    }

    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        let gatt = self.gatt(characteristic)?;
        // the chunk stream is paced by Nordic acks, not by GATT write
        // responses
        let write_type = if characteristic == Characteristic::FileWrite {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        self.peripheral
            .write(gatt, data, write_type)
            .await
            .map_err(|err| BleError::Write {
                characteristic,
                reason: err.to_string(),
            })
    }

    fn notifications(
        &self,
        characteristic: Characteristic,
    ) -> Result<broadcast::Receiver<Vec<u8>>, BleError> {
        match characteristic {
            Characteristic::GeneralPlusListen => Ok(self.gp_tx.subscribe()),
            Characteristic::NordicListen => Ok(self.nordic_tx.subscribe()),
            Characteristic::RssiListen => Ok(self.rssi_tx.subscribe()),
            other => Err(BleError::Unsupported {
                characteristic: other,
                operation: "notifications",
            }),
        }
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.connected.store(false, Ordering::SeqCst);
        self.peripheral
            .disconnect()
            .await
            .map_err(connection_err)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn mtu(&self) -> usize {
        protocol::MAX_PACKET_SIZE
    }
}
