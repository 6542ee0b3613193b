//! The per-device actor task
//!
//! Owns the `Session` exclusively. Commands arrive over an mpsc channel
//! and are answered over oneshot channels; between commands the actor
//! pumps device notifications into the event bus and runs the keepalive
//! probe. The actor exits on disconnect, on command-channel closure, or
//! when a keepalive probe goes unanswered; it never reconnects itself.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::info::{read_device_info, DeviceInfo};
use super::{keys, DeviceError};
use crate::ble::await_notification;
use crate::ble::link::Characteristic;
use crate::cache::StateCache;
use crate::dlc::{DlcCoordinator, SlotInfo};
use crate::events::{DeviceEvent, EventBus};
use crate::protocol::{self, GeneralPlusResponse, MoodAction, MoodType};
use crate::session::{Session, SessionStatus};

pub(crate) enum Command {
    GetInfo(oneshot::Sender<Result<DeviceInfo, DeviceError>>),
    SetAntenna {
        red: u8,
        green: u8,
        blue: u8,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    TriggerAction {
        input: u8,
        index: u8,
        subindex: u8,
        specific: u8,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    SetName {
        name_id: u8,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    SetMood {
        action: MoodAction,
        mood: MoodType,
        value: u8,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    SetLcdBacklight {
        on: bool,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    CycleDebugMenu(oneshot::Sender<Result<(), DeviceError>>),
    Upload {
        slot: usize,
        data: Vec<u8>,
        filename: String,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    Load {
        slot: usize,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    Activate(oneshot::Sender<Result<(), DeviceError>>),
    Deactivate {
        slot: usize,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    Delete {
        slot: usize,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    RefreshSlots(oneshot::Sender<Result<Vec<SlotInfo>, DeviceError>>),
    Slots(oneshot::Sender<Vec<SlotInfo>>),
    Status(oneshot::Sender<SessionStatus>),
    Flush(oneshot::Sender<Result<(), DeviceError>>),
    Disconnect(oneshot::Sender<()>),
}

pub(crate) struct Actor {
    pub session: Session,
    pub dlc: DlcCoordinator,
    pub cache: StateCache,
    pub bus: EventBus,
    pub cancel: Arc<AtomicBool>,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub rx: mpsc::Receiver<Command>,
}

impl Actor {
    pub(crate) async fn run(mut self) {
        let mut gp = match self.session.subscribe(Characteristic::GeneralPlusListen) {
            Ok(rx) => rx,
            Err(err) => {
                warn!("device task could not subscribe to notifications: {err}");
                return;
            }
        };
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle(cmd).await {
                            break;
                        }
                    }
                    None => {
                        debug!("all handles dropped, shutting down device task");
                        break;
                    }
                },
                note = gp.recv() => match note {
                    Ok(packet) => self.pump(&packet),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("device notifications lagged, {n} packets skipped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("notification stream closed");
                        break;
                    }
                },
                _ = keepalive.tick() => {
                    if !self.probe().await {
                        warn!("keepalive probe unanswered, treating connection as dead");
                        break;
                    }
                }
            }
        }

        let address = self.session.address().to_string();
        self.session.disconnect().await;
        if let Err(err) = self.cache.flush().await {
            warn!("final cache flush failed: {err}");
        }
        self.bus.publish(DeviceEvent::Disconnected { address });
    }

    /// Returns false when the actor should exit.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::GetInfo(reply) => {
                let result = read_device_info(&self.session).await.map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::SetAntenna {
                red,
                green,
                blue,
                reply,
            } => {
                let result = self
                    .write_and_mirror(
                        protocol::set_antenna(red, green, blue),
                        keys::ANTENNA,
                        json!([red, green, blue]),
                    )
                    .await;
                let _ = reply.send(result);
            }
            Command::TriggerAction {
                input,
                index,
                subindex,
                specific,
                reply,
            } => {
                let result = self
                    .gp_write(protocol::trigger_action(input, index, subindex, specific))
                    .await;
                let _ = reply.send(result);
            }
            Command::SetName { name_id, reply } => {
                let result = self
                    .write_and_mirror(protocol::set_name(name_id), keys::NAME_ID, json!(name_id))
                    .await;
                let _ = reply.send(result);
            }
            Command::SetMood {
                action,
                mood,
                value,
                reply,
            } => {
                let result = match action {
                    MoodAction::Set => {
                        self.write_and_mirror(
                            protocol::set_mood(action, mood, value),
                            &keys::mood(mood),
                            json!(value),
                        )
                        .await
                    }
                    // a delta leaves the absolute meter value unknown
                    MoodAction::Increase => {
                        self.gp_write(protocol::set_mood(action, mood, value)).await
                    }
                };
                let _ = reply.send(result);
            }
            Command::SetLcdBacklight { on, reply } => {
                let result = self
                    .write_and_mirror(
                        protocol::set_lcd_backlight(on),
                        keys::LCD_BACKLIGHT,
                        json!(on),
                    )
                    .await;
                let _ = reply.send(result);
            }
            Command::CycleDebugMenu(reply) => {
                let result = self.gp_write(protocol::cycle_debug_menu()).await;
                let _ = reply.send(result);
            }
            Command::Upload {
                slot,
                data,
                filename,
                reply,
            } => {
                let result = self
                    .dlc
                    .upload(&self.session, slot, &data, &filename, &self.cancel)
                    .await
                    .map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::Load { slot, reply } => {
                let result = self.dlc.load(&self.session, slot).await.map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::Activate(reply) => {
                let result = self.dlc.activate(&self.session).await.map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::Deactivate { slot, reply } => {
                let result = self
                    .dlc
                    .deactivate(&self.session, slot)
                    .await
                    .map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::Delete { slot, reply } => {
                let result = self
                    .dlc
                    .delete(&self.session, slot)
                    .await
                    .map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::RefreshSlots(reply) => {
                let result = self
                    .dlc
                    .refresh_slots(&self.session)
                    .await
                    .map(|()| self.dlc.slots().to_vec())
                    .map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::Slots(reply) => {
                let _ = reply.send(self.dlc.slots().to_vec());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.session.status());
            }
            Command::Flush(reply) => {
                let _ = reply.send(self.cache.flush().await.map_err(Into::into));
            }
            Command::Disconnect(reply) => {
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn gp_write(&self, packet: Vec<u8>) -> Result<(), DeviceError> {
        self.session
            .write(Characteristic::GeneralPlusWrite, &packet)
            .await?;
        Ok(())
    }

    /// Write a behavior command and, on success, mirror the new value
    /// into the cache and the event bus.
    async fn write_and_mirror(
        &self,
        packet: Vec<u8>,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), DeviceError> {
        self.gp_write(packet).await?;
        self.cache.set(key, value.clone()).await?;
        self.bus.publish(DeviceEvent::StateChanged {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Forward a device-pushed notification to the event bus, in the
    /// order it came off the transport.
    fn pump(&self, packet: &[u8]) {
        if protocol::is_sensor_status(packet) {
            self.bus.publish(DeviceEvent::Sensor {
                data: packet.to_vec(),
            });
        } else if let Some(code) = protocol::parse_furby_message(packet) {
            self.bus.publish(DeviceEvent::Message { code });
        } else {
            debug!("unhandled notification: {}", hex::encode(packet));
        }
    }

    /// Liveness probe for silently-dead links: ask for the firmware
    /// version and require an answer within the keepalive deadline.
    async fn probe(&self) -> bool {
        let mut gp = match self.session.subscribe(Characteristic::GeneralPlusListen) {
            Ok(rx) => rx,
            Err(_) => return false,
        };
        if self
            .session
            .write(Characteristic::GeneralPlusWrite, &protocol::firmware_probe())
            .await
            .is_err()
        {
            return false;
        }
        await_notification(&mut gp, self.keepalive_timeout, |p| {
            protocol::response_id(p) == Some(GeneralPlusResponse::FirmwareVersion as u8)
        })
        .await
        .is_ok()
    }
}
