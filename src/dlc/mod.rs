//! Content upload coordinator
//!
//! Drives the multi-slot DLC protocol: announce, stop-and-wait chunk
//! stream with per-packet Nordic acks, commit confirmation, and the
//! load/activate/deactivate/delete slot operations. Keeps a local shadow
//! of each slot's state, updated only on device-confirmed transitions;
//! a failure mid-transfer leaves the shadow at the last confirmed value.

pub mod upload;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::ble::link::Characteristic;
use crate::ble::{await_notification, BleError};
use crate::events::{DeviceEvent, EventBus};
use crate::protocol::{self, FileTransferMode, SlotState};
use crate::session::{Session, SessionError};
use upload::UploadSession;

/// Publish an `UploadProgress` event every this many acknowledged chunks
/// (and always on the final one).
const PROGRESS_STRIDE: usize = 16;

#[derive(Error, Debug)]
pub enum DlcError {
    #[error("no such slot {slot}")]
    UnknownSlot { slot: usize },

    #[error("slot {slot} is {state:?}, not empty")]
    SlotBusy { slot: usize, state: SlotState },

    #[error("content of {size} bytes exceeds slot {slot} capacity {capacity}")]
    SlotTooSmall {
        slot: usize,
        size: usize,
        capacity: usize,
    },

    #[error("slot {slot} is {state:?}; operation needs {needed}")]
    InvalidSlotState {
        slot: usize,
        state: SlotState,
        needed: &'static str,
    },

    #[error("no acknowledgement for chunk at offset {offset} in slot {slot}")]
    AckTimeout { slot: usize, offset: usize },

    #[error("device never confirmed commit of slot {slot}")]
    CommitTimeout { slot: usize },

    #[error("device refused transfer into slot {slot}: {mode:?}")]
    Refused { slot: usize, mode: FileTransferMode },

    #[error("upload into slot {slot} cancelled at offset {offset}")]
    Cancelled { slot: usize, offset: usize },

    #[error(transparent)]
    Transport(#[from] SessionError),
}

impl From<BleError> for DlcError {
    fn from(err: BleError) -> Self {
        DlcError::Transport(SessionError::Transport(err))
    }
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub capacity: usize,
    pub state: SlotState,
}

pub struct DlcCoordinator {
    slots: Vec<SlotInfo>,
    chunk_size: usize,
    ack_timeout: Duration,
    commit_timeout: Duration,
    loaded: Option<usize>,
    bus: EventBus,
}

impl DlcCoordinator {
    pub fn new(
        slot_capacities: &[usize],
        chunk_size: usize,
        ack_timeout: Duration,
        commit_timeout: Duration,
        bus: EventBus,
    ) -> Self {
        Self {
            slots: slot_capacities
                .iter()
                .map(|&capacity| SlotInfo {
                    capacity,
                    state: SlotState::Empty,
                })
                .collect(),
            chunk_size,
            ack_timeout,
            commit_timeout,
            loaded: None,
            bus,
        }
    }

    pub fn slots(&self) -> &[SlotInfo] {
        &self.slots
    }

    fn slot(&self, slot: usize) -> Result<SlotInfo, DlcError> {
        self.slots
            .get(slot)
            .copied()
            .ok_or(DlcError::UnknownSlot { slot })
    }

    fn set_state(&mut self, slot: usize, state: SlotState) {
        if self.slots[slot].state != state {
            self.slots[slot].state = state;
            self.bus.publish(DeviceEvent::SlotChanged { slot, state });
        }
    }

    /// Resynchronize the shadow table from the device's slot-state reply.
    pub async fn refresh_slots(&mut self, session: &Session) -> Result<(), DlcError> {
        let mut gp = session.subscribe(Characteristic::GeneralPlusListen)?;
        session
            .write(
                Characteristic::GeneralPlusWrite,
                &protocol::query_slot_states(),
            )
            .await?;
        let packet = await_notification(&mut gp, self.ack_timeout, |p| {
            protocol::parse_slot_states(p).is_some()
        })
        .await?;
        // parse cannot fail, the predicate above already accepted it
        if let Some(states) = protocol::parse_slot_states(&packet) {
            for (slot, state) in states.into_iter().take(self.slots.len()).enumerate() {
                self.set_state(slot, state);
            }
        }
        debug!("slot shadow refreshed: {:?}", self.slots);
        Ok(())
    }

    /// Upload `data` into `slot` using stop-and-wait flow control.
    ///
    /// The slot must be empty and large enough; both checks happen before
    /// a single byte goes out. `cancel` is checked at every chunk
    /// boundary. On any failure the shadow stays at the last
    /// device-confirmed state, which after a refused announce is still
    /// `Empty` and after a mid-stream stall is `Uploading`.
    pub async fn upload(
        &mut self,
        session: &Session,
        slot: usize,
        data: &[u8],
        filename: &str,
        cancel: &AtomicBool,
    ) -> Result<(), DlcError> {
        let info = self.slot(slot)?;
        if info.state != SlotState::Empty {
            return Err(DlcError::SlotBusy {
                slot,
                state: info.state,
            });
        }
        if data.len() > info.capacity {
            return Err(DlcError::SlotTooSmall {
                slot,
                size: data.len(),
                capacity: info.capacity,
            });
        }

        let mut gp = session.subscribe(Characteristic::GeneralPlusListen)?;
        let mut nordic = session.subscribe(Characteristic::NordicListen)?;

        session
            .write(
                Characteristic::NordicWrite,
                &protocol::nordic_packet_ack(true),
            )
            .await?;
        session
            .write(
                Characteristic::GeneralPlusWrite,
                &protocol::announce_upload(data.len(), slot as u8, filename),
            )
            .await?;

        let reply = await_transfer_mode(&mut gp, self.ack_timeout)
            .await
            .map_err(|err| match err {
                BleError::Timeout => DlcError::Refused {
                    slot,
                    mode: FileTransferMode::TransferTimeout,
                },
                other => other.into(),
            })?;
        if reply != FileTransferMode::ReadyToReceive {
            return Err(DlcError::Refused { slot, mode: reply });
        }
        self.set_state(slot, SlotState::Uploading);

        let chunk_size = self.chunk_size.min(session.mtu());
        let mut transfer = UploadSession::new(slot, data.len(), chunk_size);
        info!(
            "uploading {} bytes into slot {slot} as {} chunks of {chunk_size}",
            data.len(),
            transfer.chunk_count()
        );

        let mut acked_chunks = 0usize;
        while let Some(range) = transfer.next_chunk() {
            if cancel.load(Ordering::SeqCst) {
                let offset = transfer.offset();
                transfer.mark_failed("cancelled");
                warn!("upload into slot {slot} cancelled at offset {offset}");
                return Err(DlcError::Cancelled { slot, offset });
            }
            session
                .write(Characteristic::FileWrite, &data[range])
                .await?;
            transfer.mark_sent();
            let ack = await_notification(&mut nordic, self.ack_timeout, |p| {
                protocol::is_packet_ack(p)
            })
            .await;
            match ack {
                Ok(_) => transfer.mark_acked(),
                Err(BleError::Timeout) => {
                    let offset = transfer.offset();
                    transfer.mark_failed("ack timeout");
                    return Err(DlcError::AckTimeout { slot, offset });
                }
                Err(other) => return Err(other.into()),
            }
            acked_chunks += 1;
            if acked_chunks % PROGRESS_STRIDE == 0 || transfer.is_done() {
                self.bus.publish(DeviceEvent::UploadProgress {
                    slot,
                    sent: transfer.offset(),
                    total: transfer.total(),
                });
            }
        }

        // The final ack only confirms receipt. Wait for the device to
        // report the slot committed before declaring success.
        let commit = await_transfer_mode(&mut gp, self.commit_timeout)
            .await
            .map_err(|err| match err {
                BleError::Timeout => DlcError::CommitTimeout { slot },
                other => other.into(),
            })?;
        if commit != FileTransferMode::ReceivedOk {
            return Err(DlcError::Refused { slot, mode: commit });
        }
        self.set_state(slot, SlotState::Uploaded);
        info!("slot {slot} committed");
        Ok(())
    }

    /// Load committed content so a later `activate` can start it.
    pub async fn load(&mut self, session: &Session, slot: usize) -> Result<(), DlcError> {
        let info = self.slot(slot)?;
        if info.state != SlotState::Uploaded {
            return Err(DlcError::InvalidSlotState {
                slot,
                state: info.state,
                needed: "uploaded",
            });
        }
        session
            .write(Characteristic::GeneralPlusWrite, &protocol::load_slot(slot as u8))
            .await?;
        self.loaded = Some(slot);
        Ok(())
    }

    /// Activate the loaded slot, deactivating any currently active one
    /// first so at most one slot is ever active.
    pub async fn activate(&mut self, session: &Session) -> Result<(), DlcError> {
        let Some(slot) = self.loaded else {
            return Err(DlcError::InvalidSlotState {
                slot: 0,
                state: SlotState::Empty,
                needed: "a loaded slot",
            });
        };
        if let Some(active) = self
            .slots
            .iter()
            .position(|s| s.state == SlotState::Active)
        {
            if active != slot {
                session
                    .write(
                        Characteristic::GeneralPlusWrite,
                        &protocol::deactivate_slot(active as u8),
                    )
                    .await?;
                self.set_state(active, SlotState::Uploaded);
            }
        }
        session
            .write(Characteristic::GeneralPlusWrite, &protocol::activate())
            .await?;
        self.set_state(slot, SlotState::Active);
        info!("slot {slot} activated");
        Ok(())
    }

    pub async fn deactivate(&mut self, session: &Session, slot: usize) -> Result<(), DlcError> {
        let info = self.slot(slot)?;
        if info.state != SlotState::Active {
            return Err(DlcError::InvalidSlotState {
                slot,
                state: info.state,
                needed: "active",
            });
        }
        session
            .write(
                Characteristic::GeneralPlusWrite,
                &protocol::deactivate_slot(slot as u8),
            )
            .await?;
        self.set_state(slot, SlotState::Uploaded);
        Ok(())
    }

    /// Delete a slot's content. Accepted from any state, including
    /// `Uploading`; it is the documented way to abandon a stalled
    /// transfer.
    pub async fn delete(&mut self, session: &Session, slot: usize) -> Result<(), DlcError> {
        self.slot(slot)?;
        session
            .write(
                Characteristic::GeneralPlusWrite,
                &protocol::delete_slot(slot as u8),
            )
            .await?;
        if self.loaded == Some(slot) {
            self.loaded = None;
        }
        self.set_state(slot, SlotState::Empty);
        Ok(())
    }
}

/// Wait for the next file-transfer status notification and return its
/// parsed mode.
async fn await_transfer_mode(
    rx: &mut tokio::sync::broadcast::Receiver<Vec<u8>>,
    within: Duration,
) -> Result<FileTransferMode, BleError> {
    let mut seen = None;
    await_notification(rx, within, |p| {
        seen = protocol::parse_file_transfer(p);
        seen.is_some()
    })
    .await?;
    seen.ok_or(BleError::Timeout)
}
