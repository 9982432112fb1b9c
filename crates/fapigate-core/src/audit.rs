//! Audit events for security decisions.
//!
//! Every pass through the security gate records exactly one audit event,
//! admit or reject. Audit delivery is best-effort by contract: a sink failure
//! is logged by the caller and never alters the security decision, and a slow
//! sink must never block the response path. The channel-backed sink exists
//! for exactly that reason.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::store::StoreError;

/// Outcome of a security decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The request passed every gate check
    Admitted,
    /// The request was rejected; `code` is the stable error code
    Rejected {
        /// Stable machine-readable rejection code
        code: String,
    },
}

impl AuditOutcome {
    /// Check whether this outcome admitted the request
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// One security decision, as recorded for audit
///
/// The interaction id is kept as the raw header value so rejections caused by
/// a malformed id are still attributable to the request that carried it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Raw interaction id header value
    pub interaction_id: String,
    /// Participant the request claimed, when known at decision time
    pub participant: Option<String>,
    /// Gateway operation the request targeted
    pub operation: String,
    /// Admit or reject
    pub outcome: AuditOutcome,
    /// When the decision was taken
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Record an admitted request
    pub fn admitted(
        interaction_id: impl Into<String>,
        participant: impl Into<String>,
        operation: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            interaction_id: interaction_id.into(),
            participant: Some(participant.into()),
            operation: operation.into(),
            outcome: AuditOutcome::Admitted,
            occurred_at,
        }
    }

    /// Record a rejected request
    pub fn rejected(
        interaction_id: impl Into<String>,
        participant: Option<String>,
        operation: impl Into<String>,
        code: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            interaction_id: interaction_id.into(),
            participant,
            operation: operation.into(),
            outcome: AuditOutcome::Rejected { code: code.into() },
            occurred_at,
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AuditOutcome::Admitted => {
                write!(f, "{} {} admitted", self.operation, self.interaction_id)
            }
            AuditOutcome::Rejected { code } => {
                write!(
                    f,
                    "{} {} rejected ({code})",
                    self.operation, self.interaction_id
                )
            }
        }
    }
}

/// Destination for audit events
///
/// Implementations must be cheap to call from the request path; anything
/// durable belongs behind a channel or an async batch writer.
#[async_trait]
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    /// Record one audit event
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError>;
}

/// Sink that hands events to a background consumer over an unbounded channel
///
/// The send itself never blocks; the consumer decides durability. Dropping
/// the receiver makes subsequent records fail, which callers treat as a
/// best-effort loss, not a request failure.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Create a sink and the receiving end for the consumer task
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AuditSink for ChannelAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.tx
            .send(event)
            .map_err(|_| StoreError::unavailable("audit channel closed"))
    }
}

/// In-memory sink collecting events for inspection in tests
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: parking_lot::Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events in arrival order
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check whether no events have been recorded
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.events.lock().push(event);
        Ok(())
    }
}
