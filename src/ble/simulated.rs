//! In-process simulated peripheral
//!
//! Emulates the toy well enough to exercise the whole bridge without BLE
//! hardware: device-information reads with configurable latency, the
//! GeneralPlus command set, the chunked content-transfer protocol with
//! Nordic per-packet acks, and slot bookkeeping. Used by unit and
//! integration tests; latency is driven by tokio virtual time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{broadcast, Mutex};

use super::link::{BleLink, Characteristic, LinkConnector};
use super::BleError;
use crate::protocol::{self, FileTransferMode, GeneralPlusCommand, GeneralPlusResponse, SlotState};

/// Construction parameters for a simulated peripheral.
#[derive(Debug, Clone)]
pub struct SimFurbyConfig {
    /// Capacity of each content slot in bytes. Slots are not uniform.
    pub slot_capacities: Vec<usize>,
    /// Maximum payload per write.
    pub mtu: usize,
}

impl Default for SimFurbyConfig {
    fn default() -> Self {
        Self {
            slot_capacities: vec![128 * 1024, 512 * 1024, 2_000_000],
            mtu: protocol::MAX_PACKET_SIZE,
        }
    }
}

#[derive(Debug)]
struct SimSlot {
    capacity: usize,
    state: SlotState,
}

#[derive(Debug)]
struct SimUpload {
    slot: usize,
    expected: usize,
    received: usize,
}

struct SimState {
    mtu: usize,
    info: HashMap<Characteristic, Vec<u8>>,
    read_latency: HashMap<Characteristic, Duration>,
    connect_delay: Duration,
    refuse_connects: u32,
    file_write_delay: Duration,
    ack_enabled: bool,
    drop_acks_after: Option<usize>,
    slots: Vec<SimSlot>,
    upload: Option<SimUpload>,
    loaded: Option<usize>,
    write_counts: HashMap<Characteristic, usize>,
    total_writes: usize,
}

struct SimShared {
    state: Mutex<SimState>,
    gp_tx: broadcast::Sender<Vec<u8>>,
    nordic_tx: broadcast::Sender<Vec<u8>>,
    rssi_tx: broadcast::Sender<Vec<u8>>,
    connected: AtomicBool,
    generation: AtomicU64,
}

/// A simulated peripheral. Cloning yields another handle to the same
/// device; it also acts as its own `LinkConnector`.
#[derive(Clone)]
pub struct SimFurby {
    shared: Arc<SimShared>,
}

impl SimFurby {
    pub fn new(config: SimFurbyConfig) -> Self {
        let mut info = HashMap::new();
        info.insert(
            Characteristic::ManufacturerName,
            b"Hasbro".to_vec(),
        );
        info.insert(Characteristic::ModelNumber, b"Furby Connect".to_vec());
        info.insert(Characteristic::SerialNumber, b"FC2016-0001".to_vec());
        info.insert(Characteristic::HardwareRevision, b"12".to_vec());
        info.insert(Characteristic::FirmwareRevision, b"2.1.0".to_vec());
        info.insert(Characteristic::SoftwareRevision, b"2.0.8".to_vec());

        let (gp_tx, _) = broadcast::channel(1024);
        let (nordic_tx, _) = broadcast::channel(1024);
        let (rssi_tx, _) = broadcast::channel(64);

        Self {
            shared: Arc::new(SimShared {
                state: Mutex::new(SimState {
                    mtu: config.mtu,
                    info,
                    read_latency: HashMap::new(),
                    connect_delay: Duration::ZERO,
                    refuse_connects: 0,
                    file_write_delay: Duration::ZERO,
                    ack_enabled: false,
                    drop_acks_after: None,
                    slots: config
                        .slot_capacities
                        .iter()
                        .map(|&capacity| SimSlot {
                            capacity,
                            state: SlotState::Empty,
                        })
                        .collect(),
                    upload: None,
                    loaded: None,
                    write_counts: HashMap::new(),
                    total_writes: 0,
                }),
                gp_tx,
                nordic_tx,
                rssi_tx,
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    // Test-control surface.

    pub async fn set_read_latency(&self, characteristic: Characteristic, latency: Duration) {
        self.shared
            .state
            .lock()
            .await
            .read_latency
            .insert(characteristic, latency);
    }

    pub async fn set_connect_delay(&self, delay: Duration) {
        self.shared.state.lock().await.connect_delay = delay;
    }

    /// Refuse the next `n` connect attempts with a connection error.
    pub async fn refuse_next_connects(&self, n: u32) {
        self.shared.state.lock().await.refuse_connects = n;
    }

    pub async fn set_info_field(&self, characteristic: Characteristic, value: &str) {
        self.shared
            .state
            .lock()
            .await
            .info
            .insert(characteristic, value.as_bytes().to_vec());
    }

    /// Make a device-information characteristic unreadable.
    pub async fn clear_info_field(&self, characteristic: Characteristic) {
        self.shared.state.lock().await.info.remove(&characteristic);
    }

    /// Stop acknowledging file chunks after the n-th write.
    pub async fn drop_acks_after(&self, n: usize) {
        self.shared.state.lock().await.drop_acks_after = Some(n);
    }

    /// Delay each file-chunk write by the given duration.
    pub async fn set_file_write_delay(&self, delay: Duration) {
        self.shared.state.lock().await.file_write_delay = delay;
    }

    /// Mark a slot as holding committed content without uploading.
    pub async fn preload_slot(&self, slot: usize) {
        let mut st = self.shared.state.lock().await;
        if let Some(entry) = st.slots.get_mut(slot) {
            entry.state = SlotState::Uploaded;
        }
    }

    pub async fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.shared
            .state
            .lock()
            .await
            .slots
            .get(slot)
            .map(|s| s.state)
    }

    pub async fn write_count(&self, characteristic: Characteristic) -> usize {
        self.shared
            .state
            .lock()
            .await
            .write_counts
            .get(&characteristic)
            .copied()
            .unwrap_or(0)
    }

    pub async fn total_write_count(&self) -> usize {
        self.shared.state.lock().await.total_writes
    }

    /// Push a raw GeneralPlus notification, as if device-initiated.
    pub fn inject_gp_notification(&self, packet: Vec<u8>) {
        let _ = self.shared.gp_tx.send(packet);
    }

    /// Kill the physical connection without either side disconnecting.
    pub fn force_disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_link_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkConnector for SimFurby {
    async fn connect(&self, address: &str) -> Result<Box<dyn BleLink>, BleError> {
        let (delay, mtu) = {
            let mut st = self.shared.state.lock().await;
            if st.refuse_connects > 0 {
                st.refuse_connects -= 1;
                return Err(BleError::Connection(format!(
                    "peripheral {address} refused the connection"
                )));
            }
            (st.connect_delay, st.mtu)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.shared.connected.swap(true, Ordering::SeqCst) {
            return Err(BleError::Connection(format!(
                "peripheral {address} already has an active connection"
            )));
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("simulated peripheral {address} connected (generation {generation})");
        Ok(Box::new(SimLink {
            shared: Arc::clone(&self.shared),
            generation,
            mtu,
        }))
    }
}

/// One physical connection to the simulated peripheral. A stale link from
/// a previous connection observes every operation as `Disconnected`.
pub struct SimLink {
    shared: Arc<SimShared>,
    generation: u64,
    mtu: usize,
}

impl SimLink {
    fn alive(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
            && self.shared.generation.load(Ordering::SeqCst) == self.generation
    }
}

#[async_trait]
impl BleLink for SimLink {
    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, BleError> {
        if !self.alive() {
            return Err(BleError::Disconnected);
        }
        let (latency, value) = {
            let st = self.shared.state.lock().await;
            (
                st.read_latency
                    .get(&characteristic)
                    .copied()
                    .unwrap_or(Duration::ZERO),
                st.info.get(&characteristic).cloned(),
            )
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.alive() {
            return Err(BleError::Disconnected);
        }
        value.ok_or_else(|| BleError::Read {
            characteristic,
            reason: "no value".into(),
        })
    }

    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), BleError> {
        if !self.alive() {
            return Err(BleError::Disconnected);
        }
        if characteristic == Characteristic::FileWrite {
            let delay = self.shared.state.lock().await.file_write_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
                if !self.alive() {
                    return Err(BleError::Disconnected);
                }
            }
        }

        let mut st = self.shared.state.lock().await;
        if data.len() > st.mtu {
            return Err(BleError::Write {
                characteristic,
                reason: format!("payload {} exceeds mtu {}", data.len(), st.mtu),
            });
        }
        *st.write_counts.entry(characteristic).or_insert(0) += 1;
        st.total_writes += 1;

        match characteristic {
            Characteristic::NordicWrite => {
                if protocol::is_packet_ack(data) && data.len() >= 2 {
                    st.ack_enabled = data[1] == 0x01;
                }
                Ok(())
            }
            Characteristic::GeneralPlusWrite => {
                self.handle_gp_command(&mut st, data);
                Ok(())
            }
            Characteristic::FileWrite => self.handle_file_chunk(&mut st, data),
            other => Err(BleError::Write {
                characteristic: other,
                reason: "characteristic is not writable".into(),
            }),
        }
    }

    fn notifications(
        &self,
        characteristic: Characteristic,
    ) -> Result<broadcast::Receiver<Vec<u8>>, BleError> {
        match characteristic {
            Characteristic::GeneralPlusListen => Ok(self.shared.gp_tx.subscribe()),
            Characteristic::NordicListen => Ok(self.shared.nordic_tx.subscribe()),
            Characteristic::RssiListen => Ok(self.shared.rssi_tx.subscribe()),
            other => Err(BleError::Unsupported {
                characteristic: other,
                operation: "notifications",
            }),
        }
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.shared.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.alive()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl SimLink {
    fn handle_gp_command(&self, st: &mut SimState, data: &[u8]) {
        let Some(&id) = data.first() else { return };
        if id == GeneralPlusCommand::AnnounceUpload as u8 {
            self.handle_announce(st, data);
        } else if id == GeneralPlusCommand::LoadSlot as u8 && data.len() >= 2 {
            st.loaded = Some(data[1] as usize);
        } else if id == GeneralPlusCommand::ActivateContent as u8 {
            if let Some(slot) = st.loaded {
                for entry in &mut st.slots {
                    if entry.state == SlotState::Active {
                        entry.state = SlotState::Uploaded;
                    }
                }
                if let Some(entry) = st.slots.get_mut(slot) {
                    entry.state = SlotState::Active;
                }
            }
        } else if id == GeneralPlusCommand::DeactivateSlot as u8 && data.len() >= 2 {
            if let Some(entry) = st.slots.get_mut(data[1] as usize) {
                if entry.state == SlotState::Active {
                    entry.state = SlotState::Uploaded;
                }
            }
        } else if id == GeneralPlusCommand::DeleteSlot as u8 && data.len() >= 2 {
            let slot = data[1] as usize;
            if let Some(entry) = st.slots.get_mut(slot) {
                entry.state = SlotState::Empty;
            }
            if st.loaded == Some(slot) {
                st.loaded = None;
            }
            if st.upload.as_ref().map(|u| u.slot) == Some(slot) {
                st.upload = None;
            }
        } else if id == GeneralPlusCommand::GetSlotStates as u8 {
            let states: Vec<SlotState> = st.slots.iter().map(|s| s.state).collect();
            let _ = self.shared.gp_tx.send(protocol::build_slot_states(&states));
        } else if id == GeneralPlusCommand::GetFirmwareVersion as u8 {
            let _ = self
                .shared
                .gp_tx
                .send(vec![GeneralPlusResponse::FirmwareVersion as u8, 0x02, 0x01]);
        }
        // Behavior commands (antenna, mood, name, action, LCD) are
        // accepted silently, as the real toy does.
    }

    fn handle_announce(&self, st: &mut SimState, data: &[u8]) {
        if data.len() < 6 {
            warn!("malformed announce packet ({} bytes)", data.len());
            return;
        }
        let size = ((data[1] as usize) << 16) | ((data[2] as usize) << 8) | data[3] as usize;
        let slot = data[5] as usize;
        let Some(entry) = st.slots.get_mut(slot) else {
            warn!("announce for unknown slot {slot}");
            return;
        };
        if entry.state != SlotState::Empty {
            let _ = self.shared.gp_tx.send(vec![
                GeneralPlusResponse::FileTransferMode as u8,
                FileTransferMode::FileAlreadyExists as u8,
            ]);
            return;
        }
        entry.state = SlotState::Uploading;
        st.upload = Some(SimUpload {
            slot,
            expected: size,
            received: 0,
        });
        let _ = self.shared.gp_tx.send(vec![
            GeneralPlusResponse::FileTransferMode as u8,
            FileTransferMode::ReadyToReceive as u8,
        ]);
    }

    fn handle_file_chunk(&self, st: &mut SimState, data: &[u8]) -> Result<(), BleError> {
        let file_writes = st
            .write_counts
            .get(&Characteristic::FileWrite)
            .copied()
            .unwrap_or(0);
        let Some(upload) = st.upload.as_mut() else {
            return Err(BleError::Write {
                characteristic: Characteristic::FileWrite,
                reason: "no transfer in progress".into(),
            });
        };
        upload.received += data.len();
        let done = upload.received >= upload.expected;
        let slot = upload.slot;

        let suppress_ack = st.drop_acks_after.is_some_and(|n| file_writes > n);
        if st.ack_enabled && !suppress_ack {
            let _ = self.shared.nordic_tx.send(vec![protocol::NORDIC_PACKET_ACK, 0x01]);
        }
        if done {
            st.upload = None;
            if let Some(entry) = st.slots.get_mut(slot) {
                entry.state = SlotState::Uploaded;
            }
            let _ = self.shared.gp_tx.send(vec![
                GeneralPlusResponse::FileTransferMode as u8,
                FileTransferMode::ReceivedOk as u8,
            ]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> SimFurby {
        SimFurby::new(SimFurbyConfig::default())
    }

    #[tokio::test]
    async fn connect_and_read_device_info() {
        let furby = sim();
        let link = furby.connect("sim").await.unwrap();
        let value = link.read(Characteristic::ManufacturerName).await.unwrap();
        assert_eq!(value, b"Hasbro");
    }

    #[tokio::test]
    async fn one_physical_connection_at_a_time() {
        let furby = sim();
        let _link = furby.connect("sim").await.unwrap();
        let second = furby.connect("sim").await;
        assert!(matches!(second, Err(BleError::Connection(_))));
    }

    #[tokio::test]
    async fn refused_connects_then_accept() {
        let furby = sim();
        furby.refuse_next_connects(2).await;
        assert!(furby.connect("sim").await.is_err());
        assert!(furby.connect("sim").await.is_err());
        assert!(furby.connect("sim").await.is_ok());
    }

    #[tokio::test]
    async fn stale_link_is_dead_after_reconnect() {
        let furby = sim();
        let old = furby.connect("sim").await.unwrap();
        old.disconnect().await.unwrap();
        let new = furby.connect("sim").await.unwrap();
        assert!(matches!(
            old.read(Characteristic::ModelNumber).await,
            Err(BleError::Disconnected)
        ));
        assert!(new.read(Characteristic::ModelNumber).await.is_ok());
    }

    #[tokio::test]
    async fn mtu_is_enforced() {
        let furby = sim();
        let link = furby.connect("sim").await.unwrap();
        let oversized = vec![0u8; protocol::MAX_PACKET_SIZE + 1];
        let result = link.write(Characteristic::GeneralPlusWrite, &oversized).await;
        assert!(matches!(result, Err(BleError::Write { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn read_latency_is_applied() {
        let furby = sim();
        furby
            .set_read_latency(Characteristic::SerialNumber, Duration::from_millis(100))
            .await;
        let link = furby.connect("sim").await.unwrap();
        let before = tokio::time::Instant::now();
        link.read(Characteristic::SerialNumber).await.unwrap();
        assert!(before.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn raw_transfer_protocol_round_trip() {
        let furby = sim();
        let link = furby.connect("sim").await.unwrap();
        let mut gp = link.notifications(Characteristic::GeneralPlusListen).unwrap();
        let mut nordic = link.notifications(Characteristic::NordicListen).unwrap();

        link.write(Characteristic::NordicWrite, &protocol::nordic_packet_ack(true))
            .await
            .unwrap();

        let data = vec![0xAB; 45];
        link.write(
            Characteristic::GeneralPlusWrite,
            &protocol::announce_upload(data.len(), 0, "RAW.DLC"),
        )
        .await
        .unwrap();
        assert_eq!(
            protocol::parse_file_transfer(&gp.recv().await.unwrap()),
            Some(FileTransferMode::ReadyToReceive)
        );
        assert_eq!(furby.slot_state(0).await, Some(SlotState::Uploading));

        for chunk in data.chunks(protocol::FILE_CHUNK_SIZE) {
            link.write(Characteristic::FileWrite, chunk).await.unwrap();
            assert!(protocol::is_packet_ack(&nordic.recv().await.unwrap()));
        }
        assert_eq!(
            protocol::parse_file_transfer(&gp.recv().await.unwrap()),
            Some(FileTransferMode::ReceivedOk)
        );
        assert_eq!(furby.slot_state(0).await, Some(SlotState::Uploaded));
        assert_eq!(furby.write_count(Characteristic::FileWrite).await, 3);
    }

    #[tokio::test]
    async fn announce_into_occupied_slot_reports_exists() {
        let furby = sim();
        furby.preload_slot(1).await;
        let link = furby.connect("sim").await.unwrap();
        let mut gp = link.notifications(Characteristic::GeneralPlusListen).unwrap();
        link.write(
            Characteristic::GeneralPlusWrite,
            &protocol::announce_upload(10, 1, "DUP.DLC"),
        )
        .await
        .unwrap();
        assert_eq!(
            protocol::parse_file_transfer(&gp.recv().await.unwrap()),
            Some(FileTransferMode::FileAlreadyExists)
        );
    }

    #[tokio::test]
    async fn slot_state_query_reports_all_slots() {
        let furby = sim();
        furby.preload_slot(2).await;
        let link = furby.connect("sim").await.unwrap();
        let mut gp = link.notifications(Characteristic::GeneralPlusListen).unwrap();
        link.write(Characteristic::GeneralPlusWrite, &protocol::query_slot_states())
            .await
            .unwrap();
        let states = protocol::parse_slot_states(&gp.recv().await.unwrap()).unwrap();
        assert_eq!(
            states,
            vec![SlotState::Empty, SlotState::Empty, SlotState::Uploaded]
        );
    }
}
