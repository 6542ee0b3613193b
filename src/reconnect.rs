//! Reconnection policy
//!
//! Jittered exponential backoff plus the supervisor loop that owns it.
//! The supervisor is the only place autonomous retry happens; sessions
//! and in-flight transfers are never silently retried. Jitter is drawn
//! independently per attempt so a fleet of bridges restarting together
//! does not retry in lockstep.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rand::Rng;
use tokio::sync::mpsc;

use crate::ble::link::LinkConnector;
use crate::cache::StateCache;
use crate::config::{BackoffConfig, BridgeConfig};
use crate::device::Furby;
use crate::events::EventBus;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            base: config.base,
            cap: config.cap,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), cap)`, jittered by the configured
    /// fraction.
    pub fn delay(&self, attempt: u32) -> Duration {
        let doubled = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = doubled.min(self.cap);
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        capped.mul_f64(factor)
    }
}

/// Keeps one device connected. Each successful connection is handed out
/// on `handles`; the loop ends when the receiving side is dropped.
pub struct Supervisor {
    connector: Arc<dyn LinkConnector>,
    config: BridgeConfig,
    cache: StateCache,
    bus: EventBus,
    policy: BackoffPolicy,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn LinkConnector>,
        config: BridgeConfig,
        cache: StateCache,
        bus: EventBus,
    ) -> Self {
        let policy = BackoffPolicy::new(config.backoff);
        Self {
            connector,
            config,
            cache,
            bus,
            policy,
        }
    }

    pub async fn run(self, handles: mpsc::Sender<Furby>) {
        let mut attempt = 0u32;
        loop {
            match Furby::connect(
                self.connector.as_ref(),
                &self.config,
                self.cache.clone(),
                self.bus.clone(),
            )
            .await
            {
                Ok(furby) => {
                    attempt = 0;
                    if handles.send(furby.clone()).await.is_err() {
                        let _ = furby.disconnect().await;
                        return;
                    }
                    furby.closed().await;
                    info!("connection to {} lost", self.config.address);
                }
                Err(err) => {
                    warn!("connect to {} failed: {err}", self.config.address);
                }
            }
            if handles.is_closed() {
                return;
            }
            attempt += 1;
            let delay = self.policy.delay(attempt);
            info!("reconnect attempt {attempt} in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimFurby, SimFurbyConfig};
    use crate::cache::WritePolicy;

    #[test]
    fn delays_stay_inside_the_jitter_bands() {
        let policy = BackoffPolicy::new(BackoffConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.25,
        });
        let nominal = [1.0, 2.0, 4.0, 8.0, 16.0, 30.0];
        for (i, &secs) in nominal.iter().enumerate() {
            let attempt = (i + 1) as u32;
            for _ in 0..50 {
                let d = policy.delay(attempt).as_secs_f64();
                assert!(
                    d >= secs * 0.75 && d <= secs * 1.25,
                    "attempt {attempt} gave {d}s outside [{}, {}]",
                    secs * 0.75,
                    secs * 1.25
                );
            }
        }
    }

    #[test]
    fn first_retry_is_spread_not_synchronized() {
        let policy = BackoffPolicy::new(BackoffConfig::default());
        let samples: Vec<f64> = (0..100).map(|_| policy.delay(1).as_secs_f64()).collect();
        let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = samples.iter().cloned().fold(0.0, f64::max);
        assert!(min >= 0.75 && max <= 1.25);
        assert!(max - min > 0.2, "100 draws collapsed into {min}..{max}");
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = BackoffPolicy::new(BackoffConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.0,
        });
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_retries_until_connected_then_reconnects_after_loss() {
        let sim = SimFurby::new(SimFurbyConfig::default());
        sim.refuse_next_connects(2).await;

        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::open(dir.path().join("state.json"), WritePolicy::Immediate)
            .await
            .unwrap();
        let bus = EventBus::new(256);
        let config = BridgeConfig {
            address: "sim".into(),
            ..BridgeConfig::default()
        };
        let supervisor = Supervisor::new(Arc::new(sim.clone()), config, cache, bus);

        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(supervisor.run(tx));

        // two refusals, then a success; backoff sleeps run on virtual time
        let first = rx.recv().await.unwrap();
        assert!(sim.is_link_connected());

        sim.force_disconnect();
        first.closed().await;
        let second = rx.recv().await.unwrap();
        assert!(sim.is_link_connected());
        assert_eq!(second.address(), "sim");

        drop(rx);
        drop(second);
        drop(first);
        sim.force_disconnect();
        task.await.unwrap();
    }
}
