//! Event fan-out
//!
//! Push-based delivery of device events to any number of subscribers.
//! Built on a bounded broadcast ring: the producer never blocks, a
//! subscriber that falls behind loses the oldest events and observes an
//! explicit `Lagged` error, and other subscribers are unaffected.
//! Dropping a `Subscription` unsubscribes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::trace;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::SlotState;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),

    #[error("event bus closed")]
    Closed,
}

/// Everything the bridge tells the outside world about the device.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    Connected { address: String },
    Disconnected { address: String },
    StateChanged { key: String, value: Value },
    Sensor { data: Vec<u8> },
    Message { code: u8 },
    SlotChanged { slot: usize, state: SlotState },
    UploadProgress { slot: usize, sent: usize, total: usize },
}

/// An event plus its bus-assigned ordering metadata.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Envelope {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DeviceEvent,
}

/// Handle to one subscriber's stream.
pub struct Subscription {
    id: Uuid,
    rx: broadcast::Receiver<Envelope>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the next event. Suspends without polling; returns
    /// `Lagged` once after the ring overwrote events this subscriber
    /// had not read yet, then resumes from the oldest retained event.
    pub async fn recv(&mut self) -> Result<Envelope, EventError> {
        match self.rx.recv().await {
            Ok(envelope) => Ok(envelope),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(EventError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => Err(EventError::Closed),
        }
    }
}

/// The fan-out itself. Cloning yields another producer handle on the
/// same ring.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    /// `capacity` is the ring size per subscriber before drop-oldest
    /// kicks in.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            rx: self.tx.subscribe(),
        }
    }

    /// Deliver an event to every current subscriber. Returns how many
    /// subscribers the event was queued for; zero subscribers is not an
    /// error.
    pub fn publish(&self, event: DeviceEvent) -> usize {
        let envelope = Envelope {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            at: Utc::now(),
            event,
        };
        trace!("event #{}: {:?}", envelope.seq, envelope.event);
        self.tx.send(envelope).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_ne!(a.id(), b.id());

        bus.publish(DeviceEvent::Connected {
            address: "aa:bb".into(),
        });
        bus.publish(DeviceEvent::StateChanged {
            key: "antenna".into(),
            value: json!([255, 0, 0]),
        });

        for sub in [&mut a, &mut b] {
            let first = sub.recv().await.unwrap();
            let second = sub.recv().await.unwrap();
            assert_eq!(first.seq, 0);
            assert_eq!(second.seq, 1);
            assert!(matches!(first.event, DeviceEvent::Connected { .. }));
            assert!(matches!(second.event, DeviceEvent::StateChanged { .. }));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        assert_eq!(
            bus.publish(DeviceEvent::Message { code: 0x06 }),
            0
        );
    }

    #[tokio::test]
    async fn lag_is_isolated_to_the_slow_subscriber() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for code in 0..5u8 {
            bus.publish(DeviceEvent::Message { code });
            // fast keeps up
            let envelope = fast.recv().await.unwrap();
            assert!(matches!(envelope.event, DeviceEvent::Message { code: c } if c == code));
        }

        // slow missed 3 of 5, sees one Lagged, then the retained tail
        assert!(matches!(slow.recv().await, Err(EventError::Lagged(3))));
        let envelope = slow.recv().await.unwrap();
        assert_eq!(envelope.seq, 3);
        let envelope = slow.recv().await.unwrap();
        assert_eq!(envelope.seq, 4);
    }

    #[tokio::test]
    async fn dropping_the_subscription_unsubscribes() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn envelope_serializes_flat() {
        let envelope = Envelope {
            seq: 3,
            at: Utc::now(),
            event: DeviceEvent::UploadProgress {
                slot: 1,
                sent: 4096,
                total: 1_500_000,
            },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "upload_progress");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["sent"], 4096);
    }
}
