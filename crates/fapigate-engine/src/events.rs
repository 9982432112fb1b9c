//! Domain events published by command flows.
//!
//! Each state transition publishes exactly one event. Publication is
//! best-effort and must never block or fail the command result; the
//! channel-backed sink exists so durable consumers can run off the request
//! path, mirroring how audit delivery works.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use fapigate_core::store::StoreError;
use fapigate_core::{AccountId, Amount, ConsentId, FileId, OperationId, ParticipantId};

use crate::bulk::BulkFileStatus;
use crate::consent::ConsentEvent;

/// Event emitted when a payment command executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentEvent {
    /// A single payment was executed
    Executed {
        /// Operation produced by the execution
        operation_id: OperationId,
        /// Consent the payment ran under
        consent: ConsentId,
        /// Submitting participant
        participant: ParticipantId,
        /// Debtor account, when the submission named one
        debtor_account: Option<AccountId>,
        /// Instructed amount in minor units
        amount: Amount,
        /// Execution time
        at: DateTime<Utc>,
    },
}

/// Event emitted by the bulk file lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BulkFileEvent {
    /// A file passed intake and entered Processing
    Received {
        /// File identifier
        file_id: FileId,
        /// Consent the file was submitted under
        consent: ConsentId,
        /// Submitting participant
        participant: ParticipantId,
        /// Items in the file
        total_items: u32,
        /// Intake time
        at: DateTime<Utc>,
    },
    /// A file settled into its terminal status
    Settled {
        /// File identifier
        file_id: FileId,
        /// Terminal status
        status: BulkFileStatus,
        /// Settlement time
        at: DateTime<Utc>,
    },
}

/// Any event a command flow can publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "aggregate", rename_all = "snake_case")]
pub enum DomainEvent {
    /// Consent lifecycle transition
    Consent(ConsentEvent),
    /// Payment execution
    Payment(PaymentEvent),
    /// Bulk file lifecycle transition
    BulkFile(BulkFileEvent),
}

impl From<ConsentEvent> for DomainEvent {
    fn from(event: ConsentEvent) -> Self {
        Self::Consent(event)
    }
}

impl From<PaymentEvent> for DomainEvent {
    fn from(event: PaymentEvent) -> Self {
        Self::Payment(event)
    }
}

impl From<BulkFileEvent> for DomainEvent {
    fn from(event: BulkFileEvent) -> Self {
        Self::BulkFile(event)
    }
}

/// Destination for domain events
#[async_trait]
pub trait EventSink: Send + Sync + std::fmt::Debug {
    /// Publish one event
    async fn publish(&self, event: DomainEvent) -> Result<(), StoreError>;
}

/// Sink that hands events to a background consumer over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiving end for the consumer task
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn publish(&self, event: DomainEvent) -> Result<(), StoreError> {
        self.tx
            .send(event)
            .map_err(|_| StoreError::unavailable("event channel closed"))
    }
}

/// In-memory sink collecting events for inspection in tests
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: parking_lot::Mutex<Vec<DomainEvent>>,
}

impl MemoryEventSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all published events in arrival order
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    /// Number of published events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check whether no events have been published
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: DomainEvent) -> Result<(), StoreError> {
        self.events.lock().push(event);
        Ok(())
    }
}
