//! Idempotent command coordination.
//!
//! At-most-once execution per (participant, key): the first arrival claims
//! the key, executes, and commits the exact response bytes; duplicates
//! replay those bytes without re-executing. Claims carry a lease so a
//! crashed execution cannot wedge the key forever, and commit proves
//! ownership with the claim ticket so a lease that lapsed mid-execution
//! surfaces as a conflict instead of a silent double commit.
//!
//! Scopes join participant and key with an ASCII unit separator, which
//! cannot occur in a validated idempotency key, so tenants can never
//! collide on equal key strings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use fapigate_core::store::StoreError;
use fapigate_core::{GatewayError, IdempotencyKey, OperationId, ParticipantId, RequestHash};

use crate::config::IdempotencyConfig;

/// Response bytes committed for replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    /// HTTP status of the original execution
    pub status: u16,
    /// Exact body bytes of the original execution
    pub body: Bytes,
    /// Operation the original execution produced
    pub operation_id: OperationId,
    /// Whether this response is being served as a replay
    pub replayed: bool,
}

/// A committed idempotency record
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    /// Hash of the request body the key was first used with
    pub request_hash: RequestHash,
    /// Response to replay
    pub response: StoredResponse,
    /// Commit time
    pub committed_at: DateTime<Utc>,
}

/// Proof of claim ownership, required to commit or release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTicket {
    token: Uuid,
}

impl ClaimTicket {
    fn fresh() -> Self {
        Self {
            token: Uuid::new_v4(),
        }
    }
}

/// Outcome of a claim attempt
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The caller owns execution for this scope
    Claimed {
        /// Ticket to present at commit or release
        ticket: ClaimTicket,
    },
    /// Another execution holds a live lease
    InFlight {
        /// Hash the in-flight execution claimed with
        request_hash: RequestHash,
    },
    /// A committed record already exists
    Committed {
        /// The committed record
        record: IdempotencyRecord,
    },
}

/// Outcome of a commit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The record was stored
    Committed,
    /// The lease lapsed and the scope moved on; nothing was stored
    ClaimLost,
}

/// Storage backing idempotency claims and committed records
#[async_trait]
pub trait IdempotencyStore: Send + Sync + std::fmt::Debug {
    /// Atomically claim a scope or report what holds it
    async fn claim(
        &self,
        scope: &str,
        request_hash: &RequestHash,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Commit a record under a held claim
    async fn commit(
        &self,
        scope: &str,
        ticket: &ClaimTicket,
        record: IdempotencyRecord,
        ttl: Duration,
    ) -> Result<CommitOutcome, StoreError>;

    /// Release a held claim without committing
    async fn release(&self, scope: &str, ticket: &ClaimTicket) -> Result<(), StoreError>;

    /// Load a committed record, if one exists
    async fn get(&self, scope: &str) -> Result<Option<IdempotencyRecord>, StoreError>;
}

enum Slot {
    InFlight {
        request_hash: RequestHash,
        token: Uuid,
        lease_expires_at: Instant,
    },
    Committed {
        record: IdempotencyRecord,
        expires_at: Instant,
    },
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InFlight { .. } => f.write_str("Slot::InFlight"),
            Self::Committed { .. } => f.write_str("Slot::Committed"),
        }
    }
}

/// In-memory idempotency store for tests and development
///
/// Atomicity rides on the map's entry locking, the same discipline the
/// shared TTL store uses.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    slots: DashMap<String, Slot>,
}

impl MemoryIdempotencyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop lapsed leases and expired records; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::InFlight {
                lease_expires_at, ..
            } => *lease_expires_at > now,
            Slot::Committed { expires_at, .. } => *expires_at > now,
        });
        before - self.slots.len()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn claim(
        &self,
        scope: &str,
        request_hash: &RequestHash,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let now = Instant::now();
        let mut entry = self.slots.entry(scope.to_string()).or_insert_with(|| {
            Slot::InFlight {
                request_hash: request_hash.clone(),
                token: Uuid::nil(),
                lease_expires_at: now,
            }
        });

        match entry.value_mut() {
            // The placeholder we just inserted, or a lapsed lease: take it
            Slot::InFlight {
                lease_expires_at,
                token,
                request_hash: held_hash,
            } if *lease_expires_at <= now => {
                let ticket = ClaimTicket::fresh();
                *token = ticket.token;
                *held_hash = request_hash.clone();
                *lease_expires_at = now + lease;
                Ok(ClaimOutcome::Claimed { ticket })
            }
            Slot::InFlight {
                request_hash: held_hash,
                ..
            } => Ok(ClaimOutcome::InFlight {
                request_hash: held_hash.clone(),
            }),
            Slot::Committed { expires_at, record } => {
                if *expires_at <= now {
                    let ticket = ClaimTicket::fresh();
                    *entry.value_mut() = Slot::InFlight {
                        request_hash: request_hash.clone(),
                        token: ticket.token,
                        lease_expires_at: now + lease,
                    };
                    Ok(ClaimOutcome::Claimed { ticket })
                } else {
                    Ok(ClaimOutcome::Committed {
                        record: record.clone(),
                    })
                }
            }
        }
    }

    async fn commit(
        &self,
        scope: &str,
        ticket: &ClaimTicket,
        record: IdempotencyRecord,
        ttl: Duration,
    ) -> Result<CommitOutcome, StoreError> {
        match self.slots.get_mut(scope) {
            Some(mut entry) => match entry.value() {
                Slot::InFlight { token, .. } if *token == ticket.token => {
                    *entry.value_mut() = Slot::Committed {
                        record,
                        expires_at: Instant::now() + ttl,
                    };
                    Ok(CommitOutcome::Committed)
                }
                _ => Ok(CommitOutcome::ClaimLost),
            },
            None => Ok(CommitOutcome::ClaimLost),
        }
    }

    async fn release(&self, scope: &str, ticket: &ClaimTicket) -> Result<(), StoreError> {
        self.slots.remove_if(scope, |_, slot| {
            matches!(slot, Slot::InFlight { token, .. } if *token == ticket.token)
        });
        Ok(())
    }

    async fn get(&self, scope: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.slots.get(scope).and_then(|entry| match entry.value() {
            Slot::Committed { record, expires_at } if *expires_at > Instant::now() => {
                Some(record.clone())
            }
            _ => None,
        }))
    }
}

/// Permission to execute, handed out exactly once per fresh scope
#[derive(Debug)]
pub struct ExecutionTicket {
    scope: String,
    ticket: ClaimTicket,
    request_hash: RequestHash,
}

/// How a command request resolved against its idempotency key
#[derive(Debug)]
pub enum Resolution {
    /// First arrival: execute, then commit or release the ticket
    Fresh(ExecutionTicket),
    /// Duplicate of a committed execution: serve these bytes, do not execute
    Replay(StoredResponse),
}

/// Coordinates claim, wait, commit and release around command execution
#[derive(Debug)]
pub struct IdempotencyCoordinator {
    config: IdempotencyConfig,
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyCoordinator {
    /// Build a coordinator over a shared idempotency store
    pub fn new(config: IdempotencyConfig, store: Arc<dyn IdempotencyStore>) -> Self {
        Self { config, store }
    }

    /// Resolve a command request to fresh execution or replay
    ///
    /// Duplicates racing the first execution wait up to the configured
    /// timeout for its commit; a duplicate carrying different bytes under
    /// the same key conflicts immediately.
    pub async fn resolve(
        &self,
        participant: &ParticipantId,
        key: &IdempotencyKey,
        request_hash: &RequestHash,
    ) -> Result<Resolution, GatewayError> {
        let scope = scope_key(participant, key);
        let deadline = tokio::time::Instant::now() + self.config.wait_timeout;

        loop {
            let outcome = self
                .store
                .claim(&scope, request_hash, self.config.claim_lease)
                .await
                .map_err(store_unavailable)?;

            match outcome {
                ClaimOutcome::Claimed { ticket } => {
                    return Ok(Resolution::Fresh(ExecutionTicket {
                        scope,
                        ticket,
                        request_hash: request_hash.clone(),
                    }));
                }
                ClaimOutcome::Committed { record } => {
                    if record.request_hash != *request_hash {
                        return Err(GatewayError::state_conflict(
                            "idempotency_conflict",
                            "idempotency key was already used with a different request",
                        ));
                    }
                    let mut response = record.response;
                    response.replayed = true;
                    tracing::debug!(participant = %participant, key = %key, "idempotent replay served");
                    return Ok(Resolution::Replay(response));
                }
                ClaimOutcome::InFlight {
                    request_hash: held_hash,
                } => {
                    if held_hash != *request_hash {
                        return Err(GatewayError::state_conflict(
                            "idempotency_conflict",
                            "idempotency key is in flight with a different request",
                        ));
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(GatewayError::state_conflict(
                            "idempotency_pending",
                            "original request is still executing; retry shortly",
                        ));
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Commit the response of a fresh execution
    ///
    /// Returns the response as it will be replayed to duplicates. A lapsed
    /// lease surfaces as a conflict: the response was produced but must not
    /// be trusted as the committed one.
    pub async fn commit(
        &self,
        ticket: ExecutionTicket,
        status: u16,
        body: Bytes,
        operation_id: OperationId,
    ) -> Result<StoredResponse, GatewayError> {
        let response = StoredResponse {
            status,
            body,
            operation_id,
            replayed: false,
        };
        let record = IdempotencyRecord {
            request_hash: ticket.request_hash,
            response: response.clone(),
            committed_at: Utc::now(),
        };

        let outcome = self
            .store
            .commit(
                &ticket.scope,
                &ticket.ticket,
                record,
                self.config.record_ttl,
            )
            .await
            .map_err(store_unavailable)?;

        match outcome {
            CommitOutcome::Committed => Ok(response),
            CommitOutcome::ClaimLost => {
                tracing::warn!(scope = %ticket.scope, "claim lease lapsed before commit");
                Err(GatewayError::state_conflict(
                    "idempotency_claim_lost",
                    "execution outlived its claim lease; outcome not committed",
                ))
            }
        }
    }

    /// Release a claim after an execution that must not be replayed
    ///
    /// Used when execution failed on infrastructure: the next arrival of the
    /// same key should execute fresh rather than replay a failure.
    pub async fn release(&self, ticket: ExecutionTicket) -> Result<(), GatewayError> {
        self.store
            .release(&ticket.scope, &ticket.ticket)
            .await
            .map_err(store_unavailable)
    }
}

/// Tenant-scoped storage key for an idempotency key
///
/// The unit separator cannot appear in a validated key (visible ASCII only),
/// so distinct (participant, key) pairs can never fold together.
pub fn scope_key(participant: &ParticipantId, key: &IdempotencyKey) -> String {
    format!("{}\u{1f}{}", participant.as_str(), key.as_str())
}

fn store_unavailable(e: StoreError) -> GatewayError {
    GatewayError::dependency_unavailable(format!("idempotency store: {e}"))
}
