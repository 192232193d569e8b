//! Session arena and published holders
//!
//! In-flight objects (MPC registrations, DistKeys, nonce batches, request
//! records) live in a `SessionArena` keyed by id and expire after a TTL.
//! A background task sweeps expired entries. Long-lived objects (party,
//! active key, active batch) sit in a `Published` holder and are replaced
//! by swapping the `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Entry<T> {
    value: T,
    /// `None` never expires
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Id-keyed store with per-entry TTL
pub struct SessionArena<T> {
    name: &'static str,
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry<T>>>,
}

impl<T: Clone + Send + Sync + 'static> SessionArena<T> {
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert with the arena TTL, replacing any previous entry
    pub async fn insert(&self, id: impl Into<String>, value: T) {
        let expires_at = Some(Instant::now() + self.ttl);
        self.entries
            .write()
            .await
            .insert(id.into(), Entry { value, expires_at });
    }

    /// Insert without expiry
    pub async fn insert_pinned(&self, id: impl Into<String>, value: T) {
        self.entries.write().await.insert(
            id.into(),
            Entry {
                value,
                expires_at: None,
            },
        );
    }

    /// Insert only when the id is free (or expired); returns whether it was inserted
    pub async fn insert_if_absent(&self, id: impl Into<String>, value: T) -> bool {
        let id = id.into();
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.get(&id).map(|e| !e.is_expired(now)).unwrap_or(false) {
            return false;
        }
        entries.insert(
            id,
            Entry {
                value,
                expires_at: Some(now + self.ttl),
            },
        );
        true
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(id)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.get(id).await.is_some()
    }

    pub async fn remove(&self, id: &str) -> Option<T> {
        self.entries.write().await.remove(id).map(|entry| entry.value)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop expired entries and return how many were removed
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Sweep every `interval` until the arena is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let arena = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(arena) = arena.upgrade() else {
                    break;
                };
                let removed = arena.sweep().await;
                if removed > 0 {
                    tracing::debug!(arena = arena.name, removed, "Swept expired sessions");
                }
            }
        })
    }
}

/// Immutable value replaced by atomic reference swap
pub struct Published<T> {
    current: StdRwLock<Arc<T>>,
}

impl<T> Published<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: StdRwLock::new(Arc::new(value)),
        }
    }

    /// Current snapshot; later swaps do not affect it
    pub fn load(&self) -> Arc<T> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the value, returning the previous snapshot
    pub fn swap(&self, value: Arc<T>) -> Arc<T> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, value)
    }

    pub fn store(&self, value: T) {
        self.swap(Arc::new(value));
    }
}
