//! Window counters with first-increment expiry.

use std::fmt::Debug;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Volatile per-key request counters.
///
/// A counter comes into existence on the first increment after absence,
/// with a time-to-live equal to the window length given at that moment.
/// Later increments never touch the expiry. When the expiry passes the key
/// is absent again and the next increment opens a new window.
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Atomically add one to the key's counter and return the new value.
    ///
    /// Returns 1 and sets the expiry to `window_seconds` when no live
    /// counter existed.
    async fn increment(&self, api_key: &str, window_seconds: u32) -> Result<u64, StoreError>;

    /// Current count, 0 when absent. Never resets or extends the window.
    async fn current_count(&self, api_key: &str) -> u64;

    /// Whole seconds until the key's window closes, `None` when absent.
    async fn remaining_ttl(&self, api_key: &str) -> Option<u64>;

    /// Drop the key's counter now. Returns whether a live counter existed.
    async fn delete(&self, api_key: &str) -> Result<bool, StoreError>;
}

/// A single counting window.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    /// Requests counted in this window
    count: u64,
    /// When the window closes
    expires_at: Instant,
}

impl WindowCounter {
    /// Open a window holding its first request.
    fn open(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            expires_at: now + window,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Duration until the window closes.
    fn duration_until_reset(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Rounds a remaining duration up to whole seconds so a live window never reports 0.
fn ceil_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Process-local counter store.
///
/// Keys are sharded across a `DashMap`; each increment holds the shard lock
/// for its key while it reads, resets or bumps the counter, so concurrent
/// callers on one key are serialized and exactly one of them opens a window.
/// Expired windows are treated as absent on access and reclaimed by
/// [`purge_expired`](Self::purge_expired).
#[derive(Debug)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, WindowCounter>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Number of stored counters, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// True when no counters are stored.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Remove every expired window and return how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Periodically purge expired windows until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged = purged, "Purged expired counter windows");
                }
            }
        })
    }

    fn live(&self, api_key: &str) -> Option<WindowCounter> {
        let now = self.clock.now();
        self.counters
            .get(api_key)
            .map(|c| *c)
            .filter(|c| !c.is_expired(now))
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, api_key: &str, window_seconds: u32) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let window = Duration::from_secs(u64::from(window_seconds));

        let count = match self.counters.entry(api_key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let counter = occupied.get_mut();
                if counter.is_expired(now) {
                    *counter = WindowCounter::open(now, window);
                    trace!(
                        api_key = %api_key,
                        window_seconds = window_seconds,
                        "Reopened expired window"
                    );
                } else {
                    counter.count = counter.count.saturating_add(1);
                }
                counter.count
            }
            Entry::Vacant(vacant) => {
                trace!(api_key = %api_key, window_seconds = window_seconds, "Opened window");
                vacant.insert(WindowCounter::open(now, window)).count
            }
        };

        Ok(count)
    }

    async fn current_count(&self, api_key: &str) -> u64 {
        self.live(api_key).map(|c| c.count).unwrap_or(0)
    }

    async fn remaining_ttl(&self, api_key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.live(api_key)
            .map(|c| ceil_secs(c.duration_until_reset(now)))
    }

    async fn delete(&self, api_key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .counters
            .remove(api_key)
            .is_some_and(|(_, c)| !c.is_expired(now)))
    }
}
