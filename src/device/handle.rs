//! Public device handle
//!
//! `Furby` is a cheap clonable handle; every operation is forwarded to
//! the device actor over a command channel and answered on a oneshot.
//! When the actor exits (disconnect, link loss, dead keepalive) pending
//! and future calls fail with `TaskGone` and `closed()` resolves, which
//! is the supervisor's cue to reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::actor::{Actor, Command};
use super::info::DeviceInfo;
use super::DeviceError;
use crate::ble::link::LinkConnector;
use crate::cache::StateCache;
use crate::config::BridgeConfig;
use crate::dlc::{DlcCoordinator, SlotInfo};
use crate::events::{DeviceEvent, EventBus, Subscription};
use crate::protocol::{MoodAction, MoodType};
use crate::session::{Session, SessionStatus};

#[derive(Clone)]
pub struct Furby {
    address: String,
    cmd_tx: mpsc::Sender<Command>,
    cancel: Arc<AtomicBool>,
    bus: EventBus,
    cache: StateCache,
}

impl Furby {
    /// Connect to the peripheral and spawn its actor task.
    pub async fn connect(
        connector: &dyn LinkConnector,
        config: &BridgeConfig,
        cache: StateCache,
        bus: EventBus,
    ) -> Result<Self, DeviceError> {
        let session = Session::connect(connector, &config.address, config.connect_timeout).await?;
        let mut dlc = DlcCoordinator::new(
            &config.slot_capacities,
            config.chunk_size,
            config.ack_timeout,
            config.commit_timeout,
            bus.clone(),
        );
        // best effort; the shadow can be resynced later with refresh_slots
        if let Err(err) = dlc.refresh_slots(&session).await {
            warn!("initial slot probe failed: {err}");
        }

        let address = session.address().to_string();
        bus.publish(DeviceEvent::Connected {
            address: address.clone(),
        });

        let cancel = Arc::new(AtomicBool::new(false));
        let (cmd_tx, rx) = mpsc::channel(32);
        let actor = Actor {
            session,
            dlc,
            cache: cache.clone(),
            bus: bus.clone(),
            cancel: Arc::clone(&cancel),
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
            rx,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            address,
            cmd_tx,
            cancel,
            bus,
            cache,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, DeviceError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| DeviceError::TaskGone)?;
        rx.await.map_err(|_| DeviceError::TaskGone)
    }

    pub async fn device_info(&self) -> Result<DeviceInfo, DeviceError> {
        self.request(Command::GetInfo).await?
    }

    pub async fn status(&self) -> Result<SessionStatus, DeviceError> {
        self.request(Command::Status).await
    }

    pub async fn set_antenna(&self, red: u8, green: u8, blue: u8) -> Result<(), DeviceError> {
        self.request(|reply| Command::SetAntenna {
            red,
            green,
            blue,
            reply,
        })
        .await?
    }

    pub async fn trigger_action(
        &self,
        input: u8,
        index: u8,
        subindex: u8,
        specific: u8,
    ) -> Result<(), DeviceError> {
        self.request(|reply| Command::TriggerAction {
            input,
            index,
            subindex,
            specific,
            reply,
        })
        .await?
    }

    pub async fn set_name(&self, name_id: u8) -> Result<(), DeviceError> {
        self.request(|reply| Command::SetName { name_id, reply })
            .await?
    }

    pub async fn set_mood(
        &self,
        action: MoodAction,
        mood: MoodType,
        value: u8,
    ) -> Result<(), DeviceError> {
        self.request(|reply| Command::SetMood {
            action,
            mood,
            value,
            reply,
        })
        .await?
    }

    pub async fn set_lcd_backlight(&self, on: bool) -> Result<(), DeviceError> {
        self.request(|reply| Command::SetLcdBacklight { on, reply })
            .await?
    }

    pub async fn cycle_debug_menu(&self) -> Result<(), DeviceError> {
        self.request(Command::CycleDebugMenu).await?
    }

    /// Upload content into a slot. Clears any stale cancellation flag
    /// before the transfer is queued, so a previous `cancel_upload` does
    /// not leak into this call.
    pub async fn upload_dlc(
        &self,
        slot: usize,
        data: Vec<u8>,
        filename: &str,
    ) -> Result<(), DeviceError> {
        self.cancel.store(false, Ordering::SeqCst);
        let filename = filename.to_string();
        self.request(|reply| Command::Upload {
            slot,
            data,
            filename,
            reply,
        })
        .await?
    }

    /// Flag the in-flight upload for cancellation; it stops at the next
    /// chunk boundary.
    pub fn cancel_upload(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub async fn load_dlc(&self, slot: usize) -> Result<(), DeviceError> {
        self.request(|reply| Command::Load { slot, reply }).await?
    }

    pub async fn activate_dlc(&self) -> Result<(), DeviceError> {
        self.request(Command::Activate).await?
    }

    pub async fn deactivate_dlc(&self, slot: usize) -> Result<(), DeviceError> {
        self.request(|reply| Command::Deactivate { slot, reply })
            .await?
    }

    pub async fn delete_dlc(&self, slot: usize) -> Result<(), DeviceError> {
        self.request(|reply| Command::Delete { slot, reply }).await?
    }

    pub async fn slots(&self) -> Result<Vec<SlotInfo>, DeviceError> {
        self.request(Command::Slots).await
    }

    pub async fn refresh_slots(&self) -> Result<Vec<SlotInfo>, DeviceError> {
        self.request(Command::RefreshSlots).await?
    }

    /// Subscribe to the device's event stream.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub async fn state(&self, key: &str) -> Option<Value> {
        self.cache.get(key).await
    }

    /// Store an externally-sourced state value, mirroring it to
    /// subscribers like any device-confirmed change.
    pub async fn set_state(&self, key: &str, value: Value) -> Result<(), DeviceError> {
        self.cache.set(key, value.clone()).await?;
        self.bus.publish(DeviceEvent::StateChanged {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Force a confirmed-on-disk write of the cached state.
    pub async fn flush(&self) -> Result<(), DeviceError> {
        self.request(Command::Flush).await?
    }

    /// Resolves once the actor task has exited for any reason.
    pub async fn closed(&self) {
        self.cmd_tx.closed().await;
    }

    /// Graceful shutdown: flushes the cache and tears the link down.
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        self.request(Command::Disconnect).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimFurby, SimFurbyConfig};
    use crate::cache::WritePolicy;
    use crate::protocol::SlotState;
    use serde_json::json;
    use std::time::Duration;

    async fn rig(dir: &tempfile::TempDir) -> (SimFurby, Furby, EventBus) {
        let furby_sim = SimFurby::new(SimFurbyConfig::default());
        let cache = StateCache::open(dir.path().join("state.json"), WritePolicy::Immediate)
            .await
            .unwrap();
        let bus = EventBus::new(1024);
        let config = BridgeConfig {
            address: "sim".into(),
            ack_timeout: Duration::from_millis(500),
            commit_timeout: Duration::from_millis(500),
            slot_capacities: vec![128, 256, 2048],
            ..BridgeConfig::default()
        };
        let furby = Furby::connect(&furby_sim, &config, cache, bus.clone())
            .await
            .unwrap();
        (furby_sim, furby, bus)
    }

    #[tokio::test]
    async fn behavior_commands_mirror_into_cache_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, furby, _bus) = rig(&dir).await;
        let mut sub = furby.subscribe();

        furby.set_antenna(0, 255, 64).await.unwrap();
        furby.set_name(42).await.unwrap();
        furby
            .set_mood(MoodAction::Set, MoodType::Fullness, 80)
            .await
            .unwrap();

        assert_eq!(
            furby.state(crate::device::keys::ANTENNA).await,
            Some(json!([0, 255, 64]))
        );
        assert_eq!(
            furby.state(crate::device::keys::NAME_ID).await,
            Some(json!(42))
        );
        assert_eq!(furby.state("mood.fullness").await, Some(json!(80)));

        let mut keys = Vec::new();
        for _ in 0..3 {
            if let DeviceEvent::StateChanged { key, .. } = sub.recv().await.unwrap().event {
                keys.push(key);
            }
        }
        assert_eq!(keys, vec!["antenna", "name_id", "mood.fullness"]);
    }

    #[tokio::test]
    async fn mood_delta_does_not_overwrite_the_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, furby, _bus) = rig(&dir).await;
        furby
            .set_mood(MoodAction::Set, MoodType::Tiredness, 50)
            .await
            .unwrap();
        furby
            .set_mood(MoodAction::Increase, MoodType::Tiredness, 5)
            .await
            .unwrap();
        assert_eq!(furby.state("mood.tiredness").await, Some(json!(50)));
    }

    #[tokio::test]
    async fn device_info_through_the_actor() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, furby, _bus) = rig(&dir).await;
        let info = furby.device_info().await.unwrap();
        assert_eq!(info.model_number, "Furby Connect");
    }

    #[tokio::test]
    async fn upload_load_activate_through_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, furby, _bus) = rig(&dir).await;
        furby.upload_dlc(0, vec![7u8; 50], "X.DLC").await.unwrap();
        furby.load_dlc(0).await.unwrap();
        furby.activate_dlc().await.unwrap();
        assert_eq!(sim.slot_state(0).await, Some(SlotState::Active));
        let slots = furby.slots().await.unwrap();
        assert_eq!(slots[0].state, SlotState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_an_in_flight_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, furby, _bus) = rig(&dir).await;
        sim.set_file_write_delay(Duration::from_millis(50)).await;

        let uploader = furby.clone();
        let task = tokio::spawn(async move {
            uploader.upload_dlc(2, vec![3u8; 2000], "Y.DLC").await
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        furby.cancel_upload();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Dlc(crate::dlc::DlcError::Cancelled { slot: 2, .. })
        ));
        // device still thinks a transfer is open; delete abandons it
        furby.delete_dlc(2).await.unwrap();
        assert_eq!(sim.slot_state(2).await, Some(SlotState::Empty));
    }

    #[tokio::test]
    async fn disconnect_resolves_closed_and_fails_later_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, furby, bus) = rig(&dir).await;
        let mut sub = bus.subscribe();
        furby.disconnect().await.unwrap();
        furby.closed().await;
        assert!(matches!(
            furby.set_antenna(1, 2, 3).await,
            Err(DeviceError::TaskGone)
        ));
        loop {
            let envelope = sub.recv().await.unwrap();
            if matches!(envelope.event, DeviceEvent::Disconnected { .. }) {
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dead_link_is_detected_by_the_keepalive() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, furby, _bus) = rig(&dir).await;
        sim.force_disconnect();
        // default keepalive interval is 3s; give it two periods
        tokio::time::timeout(Duration::from_secs(10), furby.closed())
            .await
            .unwrap();
    }
}
