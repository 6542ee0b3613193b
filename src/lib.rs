//! fluffbridge - Furby Connect BLE bridge core
//!
//! Device communication and state synchronization for a Furby Connect
//! toy: a single-owner transport session, a parallel device-information
//! reader, the chunked DLC upload protocol with stop-and-wait flow
//! control, a debounced durable state cache, push-based event fan-out,
//! and a jittered reconnection supervisor. HTTP, WebSocket, and MQTT
//! surfaces are external embedders of this crate.

pub mod ble;
pub mod cache;
pub mod config;
pub mod device;
pub mod dlc;
pub mod events;
pub mod protocol;
pub mod reconnect;
pub mod session;

pub use config::BridgeConfig;
pub use device::{DeviceError, DeviceInfo, Furby};
pub use events::{DeviceEvent, EventBus, Subscription};
pub use reconnect::Supervisor;
