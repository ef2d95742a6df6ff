//! TTL-bounded, future-aware key/value map.
//!
//! Every reconciliation component parks async intermediate results keyed
//! by span id while the other half of its data arrives. Spans get
//! abandoned (the app navigates away, the native side never answers), so
//! plain maps would grow without bound. [`ExpiringMap`] bounds them:
//!
//! - a settled value lives for `ttl` after it settles, not after insert;
//! - an unsettled future never expires; the TTL countdown starts only
//!   once it resolves (with a value or with nothing);
//! - readers evict lazily, so an expired entry is absent even before the
//!   periodic sweep runs;
//! - the sweep self-cancels when the map drains and restarts on the next
//!   insert.
//!
//! The map must be used from within a tokio runtime: settlement observers
//! and the sweep are spawned tasks holding only weak references, so
//! dropping the map tears everything down.

use fnv::FnvHashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Tunables for an [`ExpiringMap`].
#[derive(Debug, Clone)]
pub struct ExpiringMapConfig {
    /// How long a settled entry stays retrievable.
    pub ttl: Duration,

    /// Periodic sweep interval; independent of and typically coarser
    /// than `ttl`.
    pub cleanup_interval: Duration,
}

impl Default for ExpiringMapConfig {
    fn default() -> Self {
        ExpiringMapConfig {
            ttl: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(5),
        }
    }
}

impl ExpiringMapConfig {
    /// Config with the given ttl and the default sweep interval.
    pub fn with_ttl(ttl: Duration) -> Self {
        ExpiringMapConfig {
            ttl,
            ..Self::default()
        }
    }
}

/// A shared handle to a future that settles to `Option<V>`.
type SettledFuture<V> = Shared<BoxFuture<'static, Option<V>>>;

enum Slot<V> {
    /// Future not yet settled; no expiry.
    Pending(SettledFuture<V>),

    /// Settled (possibly to nothing); expires at `expires_at`.
    Ready {
        value: Option<V>,
        expires_at: Instant,
    },
}

struct Entry<V> {
    /// Guards against a late-settling future resurrecting a key that was
    /// popped or overwritten in the meantime.
    generation: u64,
    slot: Slot<V>,
}

struct Inner<K, V> {
    entries: FnvHashMap<K, Entry<V>>,
    next_generation: u64,
    sweeper: Option<JoinHandle<()>>,
    ttl: Duration,
    cleanup_interval: Duration,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn evict_expired(&mut self, now: Instant) {
        self.entries.retain(|_, entry| match &entry.slot {
            Slot::Pending(_) => true,
            Slot::Ready { expires_at, .. } => *expires_at > now,
        });
    }
}

/// Result of a [`ExpiringMap::get`] or [`ExpiringMap::pop`].
pub enum Lookup<V> {
    /// The entry has settled. `None` means the originating future failed
    /// or produced nothing.
    Ready(Option<V>),

    /// The entry is still in flight; await the handle for the value.
    Pending(SettledFuture<V>),
}

impl<V: Clone> Lookup<V> {
    /// Whether the entry was still in flight at lookup time.
    pub fn is_pending(&self) -> bool {
        matches!(self, Lookup::Pending(_))
    }

    /// Wait for settlement (no-op when already settled).
    pub async fn resolved(self) -> Option<V> {
        match self {
            Lookup::Ready(value) => value,
            Lookup::Pending(fut) => fut.await,
        }
    }
}

/// TTL-bounded map holding settled values and in-flight futures.
pub struct ExpiringMap<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty map. The sweep starts with the first insert.
    pub fn new(config: ExpiringMapConfig) -> Self {
        ExpiringMap {
            inner: Arc::new(Mutex::new(Inner {
                entries: FnvHashMap::default(),
                next_generation: 0,
                sweeper: None,
                ttl: config.ttl,
                cleanup_interval: config.cleanup_interval,
            })),
        }
    }

    /// Insert a settled value; it expires `ttl` from now.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let expires_at = Instant::now() + inner.ttl;
        inner.entries.insert(
            key,
            Entry {
                generation,
                slot: Slot::Ready {
                    value: Some(value),
                    expires_at,
                },
            },
        );
        Self::ensure_sweeper(&self.inner, &mut inner);
    }

    /// Insert an in-flight future.
    ///
    /// The entry carries no expiry while the future is pending. A spawned
    /// observer rewrites it with the settled value, or with nothing if
    /// the future yields `None`, and only then starts the TTL countdown.
    pub fn insert_pending<F>(&self, key: K, fut: F)
    where
        F: Future<Output = Option<V>> + Send + 'static,
    {
        let shared: SettledFuture<V> = fut.boxed().shared();

        let generation = {
            let mut inner = self.inner.lock().unwrap();
            let generation = inner.next_generation;
            inner.next_generation += 1;
            inner.entries.insert(
                key.clone(),
                Entry {
                    generation,
                    slot: Slot::Pending(shared.clone()),
                },
            );
            Self::ensure_sweeper(&self.inner, &mut inner);
            generation
        };

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let value = shared.await;
            let Some(inner) = weak.upgrade() else { return };
            let mut inner = inner.lock().unwrap();
            let ttl = inner.ttl;
            if let Some(entry) = inner.entries.get_mut(&key) {
                // The key may have been popped and re-inserted while we
                // were waiting; only settle our own generation.
                if entry.generation == generation {
                    entry.slot = Slot::Ready {
                        value,
                        expires_at: Instant::now() + ttl,
                    };
                }
            }
        });
    }

    /// Look up a key. Expired entries are evicted and reported absent.
    pub fn get(&self, key: &K) -> Option<Lookup<V>> {
        let mut inner = self.inner.lock().unwrap();
        let result = match inner.entries.get(key) {
            None => return None,
            Some(entry) => match &entry.slot {
                Slot::Pending(fut) => Some(Lookup::Pending(fut.clone())),
                Slot::Ready { value, expires_at } => {
                    if *expires_at <= Instant::now() {
                        None
                    } else {
                        Some(Lookup::Ready(value.clone()))
                    }
                }
            },
        };
        if result.is_none() {
            inner.entries.remove(key);
        }
        result
    }

    /// Look up and remove a key in one step.
    ///
    /// A popped pending entry is gone from the map immediately; the
    /// returned handle still settles for this caller, and the observer's
    /// late write is discarded.
    pub fn pop(&self, key: &K) -> Option<Lookup<V>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.remove(key)?;
        match entry.slot {
            Slot::Pending(fut) => Some(Lookup::Pending(fut)),
            Slot::Ready { value, expires_at } => {
                if expires_at <= Instant::now() {
                    None
                } else {
                    Some(Lookup::Ready(value))
                }
            }
        }
    }

    /// Whether a key is present (pending counts, expired does not).
    pub fn contains_key(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.entries.get(key) {
            None => return false,
            Some(entry) => match &entry.slot {
                Slot::Pending(_) => false,
                Slot::Ready { expires_at, .. } => *expires_at <= Instant::now(),
            },
        };
        if expired {
            inner.entries.remove(key);
            return false;
        }
        true
    }

    /// Remaining time to live; `None` for pending, expired or absent
    /// entries.
    pub fn ttl_remaining(&self, key: &K) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        match inner.entries.get(key) {
            Some(Entry {
                slot: Slot::Ready { expires_at, .. },
                ..
            }) => expires_at.checked_duration_since(Instant::now()),
            _ => None,
        }
    }

    /// Evict all expired entries now; stops the sweep if the map drained.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.evict_expired(Instant::now());
        if inner.entries.is_empty() {
            if let Some(handle) = inner.sweeper.take() {
                handle.abort();
            }
        }
    }

    /// Remove everything and stop the sweep.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        if let Some(handle) = inner.sweeper.take() {
            handle.abort();
        }
    }

    /// Stop the periodic sweep (lazy eviction on read still applies).
    pub fn stop_cleanup(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.sweeper.take() {
            handle.abort();
        }
    }

    /// Restart the periodic sweep.
    pub fn start_cleanup(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::ensure_sweeper(&self.inner, &mut inner);
    }

    /// Number of live entries (pending included, expired included until
    /// swept or read).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn sweeper_active(&self) -> bool {
        self.inner.lock().unwrap().sweeper.is_some()
    }

    fn ensure_sweeper(arc: &Arc<Mutex<Inner<K, V>>>, inner: &mut Inner<K, V>) {
        if inner.sweeper.is_some() {
            return;
        }
        let weak: Weak<Mutex<Inner<K, V>>> = Arc::downgrade(arc);
        let interval = inner.cleanup_interval;
        inner.sweeper = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                let mut inner = inner.lock().unwrap();
                inner.evict_expired(Instant::now());
                if inner.entries.is_empty() {
                    // Self-deregister; the next insert restarts the sweep.
                    inner.sweeper = None;
                    break;
                }
            }
        }));
    }
}

impl<K, V> Drop for ExpiringMap<K, V> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(handle) = inner.sweeper.take() {
                handle.abort();
            }
        }
    }
}
