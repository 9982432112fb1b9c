//! Atomic TTL store backing replay protection, rate limiting and claims.
//!
//! The gateway's only shared mutable state lives behind this trait: a
//! distributed key-value store with per-key TTL, check-and-set, and atomic
//! increment. In a multi-instance deployment the implementation is a network
//! service; [`MemoryTtlStore`] is the in-process reference implementation
//! used by tests and single-node setups.
//!
//! Security consumers fail closed on [`StoreError`]: an unreachable store is
//! a rejection, never a default-allow.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

/// Errors surfaced by TTL store backends
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backing store could not be reached or answered abnormally
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Backend-specific detail, logged but never sent to callers
        reason: String,
    },
}

impl StoreError {
    /// Create an unavailable error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Outcome of a check-and-set operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The key was absent and has been recorded
    Inserted,
    /// The key was already present within its TTL
    AlreadyPresent,
}

/// Atomic key-value store with per-key TTL
///
/// All operations are atomic with respect to concurrent callers: there is no
/// read-modify-write exposed, only check-and-set and increment. TTLs start
/// when a key is first written and are not extended by reads.
#[async_trait]
pub trait TtlStore: Send + Sync + std::fmt::Debug {
    /// Record `key` if absent, reporting whether it was already present
    ///
    /// The single primitive behind replay detection: the first caller wins,
    /// every other caller within `ttl` observes [`SetOutcome::AlreadyPresent`].
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<SetOutcome, StoreError>;

    /// Atomically increment the counter at `key`, returning the new value
    ///
    /// The first increment in a window creates the counter at 1 and starts
    /// the TTL; the counter vanishes when the TTL elapses.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Check whether `key` is present and unexpired
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
struct TtlEntry {
    expires_at: Instant,
    count: u64,
}

/// In-process reference implementation of [`TtlStore`]
///
/// Per-key atomicity comes from the map's sharded entry locking; expired
/// entries are dropped lazily on access and in bulk via [`purge_expired`].
///
/// [`purge_expired`]: MemoryTtlStore::purge_expired
#[derive(Debug, Default)]
pub struct MemoryTtlStore {
    entries: DashMap<String, TtlEntry>,
}

impl MemoryTtlStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    /// Number of live (possibly expired, not yet purged) entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TtlStore for MemoryTtlStore {
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<SetOutcome, StoreError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(TtlEntry {
                        expires_at: now + ttl,
                        count: 1,
                    });
                    Ok(SetOutcome::Inserted)
                } else {
                    Ok(SetOutcome::AlreadyPresent)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(TtlEntry {
                    expires_at: now + ttl,
                    count: 1,
                });
                Ok(SetOutcome::Inserted)
            }
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.expires_at <= now {
                    // Window elapsed: restart the counter and the TTL
                    entry.expires_at = now + ttl;
                    entry.count = 1;
                } else {
                    entry.count += 1;
                }
                Ok(entry.count)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(TtlEntry {
                    expires_at: now + ttl,
                    count: 1,
                });
                Ok(1)
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at > now))
    }
}
