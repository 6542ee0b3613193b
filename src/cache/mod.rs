//! State cache
//!
//! In-memory mirror of last-known device state with durable JSON
//! persistence. Writes are debounced: a burst of `set` calls within the
//! window collapses into one file write of the full map. The file is
//! written to a temp path and renamed, so a crash mid-write never leaves
//! a truncated cache behind. `flush` and the timer race on the same
//! write; a single gate serializes them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// When durable writes happen relative to mutations.
///
/// `Immediate` is the fallback for environments that cannot schedule
/// delayed work: every `set` returns only after the file write completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    Immediate,
    Debounced(Duration),
}

struct CacheInner {
    path: PathBuf,
    policy: WritePolicy,
    state: RwLock<HashMap<String, Value>>,
    pending: Mutex<Option<JoinHandle<()>>>,
    write_gate: Mutex<()>,
    persist_count: AtomicU64,
}

/// Shared handle to the cache. Cloning is cheap.
#[derive(Clone)]
pub struct StateCache {
    inner: Arc<CacheInner>,
}

impl StateCache {
    /// Open the cache, loading the previous state if the file exists.
    pub async fn open(path: impl AsRef<Path>, policy: WritePolicy) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        debug!("cache opened at {} ({} keys)", path.display(), state.len());
        Ok(Self {
            inner: Arc::new(CacheInner {
                path,
                policy,
                state: RwLock::new(state),
                pending: Mutex::new(None),
                write_gate: Mutex::new(()),
                persist_count: AtomicU64::new(0),
            }),
        })
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.state.read().await.get(key).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.state.read().await.clone()
    }

    /// Update a key in memory and schedule the durable write per the
    /// policy. Under `Debounced`, any timer already pending is replaced.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        self.inner
            .state
            .write()
            .await
            .insert(key.to_string(), value);
        match self.inner.policy {
            WritePolicy::Immediate => persist(&self.inner).await,
            WritePolicy::Debounced(window) => {
                let mut pending = self.inner.pending.lock().await;
                if let Some(handle) = pending.take() {
                    handle.abort();
                }
                let inner = Arc::clone(&self.inner);
                *pending = Some(tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    if let Err(err) = persist(&inner).await {
                        warn!("debounced cache write failed: {err}");
                    }
                }));
                Ok(())
            }
        }
    }

    /// Cancel any pending timer and write the current state now.
    pub async fn flush(&self) -> Result<(), CacheError> {
        if let Some(handle) = self.inner.pending.lock().await.take() {
            handle.abort();
        }
        persist(&self.inner).await
    }

    /// Number of durable writes performed so far.
    pub fn persist_count(&self) -> u64 {
        self.inner.persist_count.load(Ordering::SeqCst)
    }
}

async fn persist(inner: &CacheInner) -> Result<(), CacheError> {
    let _gate = inner.write_gate.lock().await;
    let bytes = {
        let state = inner.state.read().await;
        serde_json::to_vec_pretty(&*state)?
    };
    let tmp = inner.path.with_extension("tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, &inner.path).await?;
    inner.persist_count.fetch_add(1, Ordering::SeqCst);
    debug!("cache persisted to {}", inner.path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("state.json")
    }

    #[tokio::test]
    async fn immediate_policy_writes_every_set() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::open(cache_path(&dir), WritePolicy::Immediate)
            .await
            .unwrap();
        cache.set("antenna", json!([255, 0, 0])).await.unwrap();
        cache.set("name_id", json!(12)).await.unwrap();
        assert_eq!(cache.persist_count(), 2);
    }

    #[tokio::test]
    async fn debounce_coalesces_a_burst_into_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::open(
            cache_path(&dir),
            WritePolicy::Debounced(Duration::from_millis(50)),
        )
        .await
        .unwrap();
        for value in 0..10 {
            cache.set("mood.fullness", json!(value)).await.unwrap();
        }
        assert_eq!(cache.persist_count(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.persist_count(), 1);

        let reloaded = StateCache::open(cache_path(&dir), WritePolicy::Immediate)
            .await
            .unwrap();
        assert_eq!(reloaded.get("mood.fullness").await, Some(json!(9)));
    }

    #[tokio::test]
    async fn flush_then_reopen_round_trips_state() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::open(
            cache_path(&dir),
            WritePolicy::Debounced(Duration::from_secs(60)),
        )
        .await
        .unwrap();
        cache.set("antenna", json!([0, 128, 255])).await.unwrap();
        cache.set("name_id", json!(77)).await.unwrap();
        cache.flush().await.unwrap();
        assert_eq!(cache.persist_count(), 1);

        let reloaded = StateCache::open(cache_path(&dir), WritePolicy::Immediate)
            .await
            .unwrap();
        assert_eq!(reloaded.get("antenna").await, Some(json!([0, 128, 255])));
        assert_eq!(reloaded.get("name_id").await, Some(json!(77)));
        assert_eq!(reloaded.get("missing").await, None);
    }

    #[tokio::test]
    async fn flush_cancels_the_pending_timer() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::open(
            cache_path(&dir),
            WritePolicy::Debounced(Duration::from_millis(50)),
        )
        .await
        .unwrap();
        cache.set("antenna", json!([1, 2, 3])).await.unwrap();
        cache.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // timer was aborted, only the explicit flush wrote
        assert_eq!(cache.persist_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_flushes_serialize_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::open(cache_path(&dir), WritePolicy::Immediate)
            .await
            .unwrap();
        cache.set("antenna", json!([9, 9, 9])).await.unwrap();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.flush().await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let reloaded = StateCache::open(cache_path(&dir), WritePolicy::Immediate)
            .await
            .unwrap();
        assert_eq!(reloaded.get("antenna").await, Some(json!([9, 9, 9])));
    }
}
