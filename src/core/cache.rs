//! TTL cache with per-key single-flight refresh.

use crate::core::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// A cached value together with the time it was fetched.
#[derive(Debug)]
pub struct Stamped<V> {
    pub value: Arc<V>,
    pub fetched_at: DateTime<Utc>,
}

impl<V> Clone for Stamped<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
        }
    }
}

/// Returned when the fetch for a key failed (now or within the negative TTL).
#[derive(Debug)]
pub struct FetchFailed<V, E> {
    pub error: Arc<E>,
    /// The most recent successful value for the key, however old.
    pub last_good: Option<Stamped<V>>,
}

/// Where a key currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Empty,
    Fresh,
    Stale,
    Refreshing,
}

struct Entry<V, E> {
    outcome: Result<Stamped<V>, Arc<E>>,
    expires_at: DateTime<Utc>,
}

struct Slot<V, E> {
    current: Option<Entry<V, E>>,
    last_good: Option<Stamped<V>>,
}

impl<V, E> Slot<V, E> {
    fn empty() -> Self {
        Self {
            current: None,
            last_good: None,
        }
    }

    fn live_entry(&self, now: DateTime<Utc>) -> Option<&Entry<V, E>> {
        self.current.as_ref().filter(|entry| now <= entry.expires_at)
    }
}

struct SlotCell<V, E> {
    slot: Mutex<Slot<V, E>>,
    fetching: AtomicBool,
}

impl<V, E> SlotCell<V, E> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::empty()),
            fetching: AtomicBool::new(false),
        }
    }
}

// Clears the in-flight flag even when the fetching future is dropped.
struct FetchingGuard<'a>(&'a AtomicBool);

impl<'a> FetchingGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for FetchingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Memoizes fetches per key for a caller-supplied TTL.
///
/// Each key has its own async lock. The caller that finds a key expired fetches
/// while holding it; concurrent callers wait on the lock and then read the entry
/// it stored, so an expiry triggers exactly one upstream fetch. Failures are
/// cached for `negative_ttl`. The last successful value is kept apart from the
/// current entry so callers can degrade to it.
pub struct TtlCache<K, V, E> {
    clock: Arc<dyn Clock>,
    negative_ttl: Duration,
    slots: Mutex<HashMap<K, Arc<SlotCell<V, E>>>>,
}

impl<K, V, E> TtlCache<K, V, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Send + Sync,
    E: Send + Sync,
{
    pub fn new(clock: Arc<dyn Clock>, negative_ttl: Duration) -> Self {
        Self {
            clock,
            negative_ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn cell(&self, key: &K) -> Arc<SlotCell<V, E>> {
        let mut slots = self.slots.lock().await;
        Arc::clone(
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(SlotCell::new())),
        )
    }

    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: K,
        ttl: Duration,
        fetch: F,
    ) -> Result<Stamped<V>, FetchFailed<V, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.cell(&key).await;
        let mut slot = cell.slot.lock().await;

        if let Some(entry) = slot.live_entry(self.clock.now()) {
            debug!("Cache HIT for key: {:?}", key);
            return match &entry.outcome {
                Ok(stamped) => Ok(stamped.clone()),
                Err(error) => Err(FetchFailed {
                    error: Arc::clone(error),
                    last_good: slot.last_good.clone(),
                }),
            };
        }

        debug!("Cache MISS for key: {:?}", key);
        let result = {
            let _fetching = FetchingGuard::set(&cell.fetching);
            fetch().await
        };
        let fetched_at = self.clock.now();

        match result {
            Ok(value) => {
                let stamped = Stamped {
                    value: Arc::new(value),
                    fetched_at,
                };
                slot.current = Some(Entry {
                    outcome: Ok(stamped.clone()),
                    expires_at: expiry(fetched_at, ttl),
                });
                slot.last_good = Some(stamped.clone());
                debug!("Cache PUT for key: {:?}", key);
                Ok(stamped)
            }
            Err(error) => {
                let error = Arc::new(error);
                slot.current = Some(Entry {
                    outcome: Err(Arc::clone(&error)),
                    expires_at: expiry(fetched_at, self.negative_ttl),
                });
                debug!("Cache PUT failure for key: {:?}", key);
                Err(FetchFailed {
                    error,
                    last_good: slot.last_good.clone(),
                })
            }
        }
    }

    /// `Refreshing` only while an upstream fetch for `key` is in flight.
    pub async fn state(&self, key: &K) -> EntryState {
        let cell = {
            let slots = self.slots.lock().await;
            match slots.get(key) {
                Some(cell) => Arc::clone(cell),
                None => return EntryState::Empty,
            }
        };
        if cell.fetching.load(Ordering::SeqCst) {
            return EntryState::Refreshing;
        }
        let slot = cell.slot.lock().await;
        match &slot.current {
            None => EntryState::Empty,
            Some(_) if slot.live_entry(self.clock.now()).is_some() => EntryState::Fresh,
            Some(_) => EntryState::Stale,
        }
    }

    /// Expires the current entry for `key`, keeping its last good value.
    pub async fn invalidate(&self, key: &K) {
        let cell = self.cell(key).await;
        cell.slot.lock().await.current = None;
        debug!("Cache INVALIDATE for key: {:?}", key);
    }

    /// Expires every entry in place. A fetch already in flight finishes first,
    /// so callers waiting on it still share its result.
    pub async fn clear(&self) {
        let cells: Vec<_> = self.slots.lock().await.values().cloned().collect();
        for cell in cells {
            cell.slot.lock().await.current = None;
        }
        debug!("Cache CLEAR");
    }
}

// Saturates instead of overflowing for very long TTLs.
fn expiry(fetched_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| fetched_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
