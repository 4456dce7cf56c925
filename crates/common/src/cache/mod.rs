//! Content-addressed result cache
//!
//! Provides:
//! - Cache keys built from (document fingerprint, operation kind, parameters hash)
//! - At most one in-flight computation per key; late callers await the first
//! - Snapshot/restore for optional persistence across restarts

use crate::errors::Result;
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::debug;

/// Operation whose output is cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Extract,
    Summarize,
    PatientInfo,
    Simplify,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Extract => "extract",
            OperationKind::Summarize => "summarize",
            OperationKind::PatientInfo => "patient_info",
            OperationKind::Simplify => "simplify",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub fingerprint: String,
    pub operation: OperationKind,
    pub params_hash: String,
}

impl CacheKey {
    /// Build a key; `params` is hashed through its JSON encoding
    pub fn new<P: Serialize>(fingerprint: &str, operation: OperationKind, params: &P) -> Result<Self> {
        let encoded = serde_json::to_vec(params)?;
        let digest = hex::encode(Sha256::digest(&encoded));
        Ok(Self {
            fingerprint: fingerprint.to_string(),
            operation,
            params_hash: digest[..16].to_string(),
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.operation, self.fingerprint, self.params_hash)
    }
}

/// Cached value with its creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: DateTime<Utc>,
}

type Slot<V> = Arc<OnceCell<CacheEntry<V>>>;

/// In-process cache that coalesces concurrent computations of the same key
pub struct CoalescingCache<V> {
    name: String,
    slots: Mutex<HashMap<CacheKey, Slot<V>>>,
}

impl<V> CoalescingCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot<V>>> {
        // The map holds no invariants a panicking holder could break.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the cached value for `key`, or run `loader` once for all concurrent callers.
    ///
    /// `fresh` discards a completed entry but joins a computation that is
    /// already running. A failed loader leaves the slot empty, so the next
    /// waiter runs its own loader.
    pub async fn get_or_try_compute<F, Fut>(&self, key: &CacheKey, fresh: bool, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let slot = {
            let mut slots = self.slots();
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()));
            if fresh && slot.initialized() {
                *slot = Arc::new(OnceCell::new());
            }
            slot.clone()
        };

        if let Some(entry) = slot.get() {
            debug!(cache = %self.name, key = %key, "Cache hit");
            metrics::record_cache(true, &self.name);
            return Ok(entry.value.clone());
        }

        debug!(cache = %self.name, key = %key, fresh, "Cache miss");
        metrics::record_cache(false, &self.name);

        let entry = slot
            .get_or_try_init(|| async {
                let value = loader().await?;
                Ok::<_, crate::errors::AppError>(CacheEntry {
                    value,
                    created_at: Utc::now(),
                })
            })
            .await?;

        Ok(entry.value.clone())
    }

    /// Completed entry for `key`, if any
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.slots().get(key).and_then(|slot| slot.get().cloned())
    }

    /// Drop the entry for `key`; in-flight waiters still receive their result
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.slots().remove(key).is_some()
    }

    /// Drop the completed entry for `key` when `predicate` holds for its value
    pub fn evict_if<P>(&self, key: &CacheKey, predicate: P) -> bool
    where
        P: FnOnce(&V) -> bool,
    {
        let mut slots = self.slots();
        let matches = slots
            .get(key)
            .and_then(|slot| slot.get())
            .map(|entry| predicate(&entry.value))
            .unwrap_or(false);
        if matches {
            slots.remove(key);
        }
        matches
    }

    /// Number of completed entries
    pub fn len(&self) -> usize {
        self.slots().values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots().clear();
    }
}

impl<V> CoalescingCache<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Completed entries, in no particular order
    pub fn snapshot(&self) -> Vec<(CacheKey, CacheEntry<V>)> {
        self.slots()
            .iter()
            .filter_map(|(key, slot)| slot.get().map(|entry| (key.clone(), entry.clone())))
            .collect()
    }

    /// Load entries from a snapshot; existing keys are overwritten
    pub fn restore(&self, entries: Vec<(CacheKey, CacheEntry<V>)>) -> usize {
        let mut slots = self.slots();
        let count = entries.len();
        for (key, entry) in entries {
            slots.insert(key, Arc::new(OnceCell::new_with(Some(entry))));
        }
        debug!(cache = %self.name, count, "Cache restored");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(fp: &str) -> CacheKey {
        CacheKey::new(fp, OperationKind::Extract, &("v1", "model")).unwrap()
    }

    #[test]
    fn test_key_depends_on_params() {
        let a = CacheKey::new("abc", OperationKind::Extract, &1u32).unwrap();
        let b = CacheKey::new("abc", OperationKind::Extract, &2u32).unwrap();
        let c = CacheKey::new("abc", OperationKind::Extract, &1u32).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.params_hash.len(), 16);
        assert!(a.to_string().starts_with("extract:abc:"));
    }

    #[tokio::test]
    async fn test_hit_skips_loader() {
        let cache: CoalescingCache<String> = CoalescingCache::new("test");
        let k = key("fp1");

        let first = cache
            .get_or_try_compute(&k, false, || async { Ok("one".to_string()) })
            .await
            .unwrap();
        let second = cache
            .get_or_try_compute(&k, false, || async { Ok("two".to_string()) })
            .await
            .unwrap();

        assert_eq!(first, "one");
        assert_eq!(second, "one");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_replaces_completed_entry() {
        let cache: CoalescingCache<u32> = CoalescingCache::new("test");
        let k = key("fp2");

        cache.get_or_try_compute(&k, false, || async { Ok(1) }).await.unwrap();
        let v = cache.get_or_try_compute(&k, true, || async { Ok(2) }).await.unwrap();

        assert_eq!(v, 2);
        assert_eq!(cache.peek(&k).unwrap().value, 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache: Arc<CoalescingCache<u32>> = Arc::new(CoalescingCache::new("test"));
        let calls = Arc::new(AtomicUsize::new(0));
        let k = key("fp3");

        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                // Odd callers ask for a fresh value; they must still join the in-flight run.
                cache
                    .get_or_try_compute(&k, i % 2 == 1, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for h in futures::future::join_all(handles).await {
            assert_eq!(h.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_loader_is_not_cached() {
        let cache: CoalescingCache<u32> = CoalescingCache::new("test");
        let k = key("fp4");

        let err = cache
            .get_or_try_compute(&k, false, || async {
                Err(AppError::DocumentNotFound { id: "x".into() })
            })
            .await;
        assert!(err.is_err());
        assert!(cache.peek(&k).is_none());

        let v = cache.get_or_try_compute(&k, false, || async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_evict_if_and_snapshot_restore() {
        let cache: CoalescingCache<u32> = CoalescingCache::new("test");
        let k1 = key("a");
        let k2 = key("b");
        cache.get_or_try_compute(&k1, false, || async { Ok(1) }).await.unwrap();
        cache.get_or_try_compute(&k2, false, || async { Ok(2) }).await.unwrap();

        assert!(!cache.evict_if(&k1, |v| *v == 2));
        assert!(cache.evict_if(&k2, |v| *v == 2));
        assert_eq!(cache.len(), 1);

        let snapshot = cache.snapshot();
        let restored: CoalescingCache<u32> = CoalescingCache::new("restored");
        assert_eq!(restored.restore(snapshot), 1);
        assert_eq!(restored.peek(&k1).unwrap().value, 1);
    }
}
