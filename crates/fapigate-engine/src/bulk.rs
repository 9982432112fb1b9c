//! Bulk payment file aggregate.
//!
//! The acceptance decision is made once, at intake: every item is validated,
//! counts and total amount are fixed, and the settled status the file will
//! end in is precomputed. What remains asynchronous is only confirmation:
//! repeated `advance_processing` calls model settlement polling, and at the
//! configured threshold the status snaps to the precomputed target. Counts
//! never change after intake, and a settled file is immutable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use fapigate_core::store::StoreError;
use fapigate_core::{
    Amount, ConsentId, FileId, GatewayError, Iban, IdempotencyKey, ParticipantId, RequestHash,
};

/// Lifecycle status of a bulk file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkFileStatus {
    /// Accepted for settlement, confirmation pending
    Processing,
    /// Every item settled
    Completed,
    /// Some items settled, some were rejected at intake
    PartiallyAccepted,
    /// No item was accepted
    Rejected,
}

impl BulkFileStatus {
    /// Whether the status is final
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Processing)
    }
}

impl std::fmt::Display for BulkFileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processing => f.write_str("processing"),
            Self::Completed => f.write_str("completed"),
            Self::PartiallyAccepted => f.write_str("partially_accepted"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// File-level integrity declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IntegrityMode {
    /// No declared digest; item validation is the only check
    None,
    /// Submitter declared a digest over the item list
    DeclaredSha256 {
        /// Base64url SHA-256 of the canonical item list
        digest: String,
    },
}

/// One payment instruction inside a bulk submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemSubmission {
    /// Submitter's end-to-end reference, carried into the report
    pub end_to_end_id: String,
    /// Creditor account
    pub creditor_iban: String,
    /// Instructed amount in minor units
    pub amount: Amount,
}

/// The client-facing shape of a bulk file upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSubmission {
    /// Consent the file is submitted under
    pub consent: ConsentId,
    /// Payment instructions
    pub items: Vec<BulkItemSubmission>,
    /// Declared integrity digest, if any
    pub integrity: IntegrityMode,
}

/// Digest of an item list as a declared integrity digest must be computed
///
/// Canonical JSON of the array, hashed the same way request bodies are, so
/// the declaration survives key reordering in transit.
pub fn items_digest(items: &[BulkItemSubmission]) -> Result<String, GatewayError> {
    Ok(RequestHash::of(&items)?.as_str().to_string())
}

/// Verdict fixed for an item at intake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ItemVerdict {
    /// The item will settle with the file
    Accepted,
    /// The item failed validation and will never settle
    Rejected {
        /// Stable human-readable rejection reason
        reason: String,
    },
}

/// Stored per-item outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemResult {
    /// Submitter's end-to-end reference
    pub end_to_end_id: String,
    /// Intake verdict
    pub verdict: ItemVerdict,
}

/// Outcome of one settlement poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The file was already settled; nothing changed
    AlreadyTerminal {
        /// The settled status
        status: BulkFileStatus,
    },
    /// Still below the settlement threshold
    Processing {
        /// Poll count after this advance
        poll_count: u32,
    },
    /// This poll crossed the threshold and the file settled
    Settled {
        /// The status the file snapped to
        status: BulkFileStatus,
    },
}

/// Bulk payment file aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkFile {
    /// File identifier
    pub id: FileId,
    /// Consent the file was submitted under
    pub consent: ConsentId,
    /// Submitting participant
    pub participant: ParticipantId,
    /// Idempotency key of the submitting request
    pub idempotency_key: IdempotencyKey,
    /// Canonical hash of the submitting request
    pub request_hash: RequestHash,
    /// Integrity declaration the file arrived with
    pub integrity: IntegrityMode,
    /// Current status
    pub status: BulkFileStatus,
    /// Settled status decided at intake, never recomputed
    pub target_status: BulkFileStatus,
    /// Settlement polls observed so far
    pub poll_count: u32,
    /// Items submitted
    pub total_items: u32,
    /// Items that passed intake validation
    pub accepted_items: u32,
    /// Items rejected at intake
    pub rejected_items: u32,
    /// Sum of accepted item amounts
    pub total_amount: Amount,
    /// Per-item verdicts in submission order
    pub items: Vec<BulkItemResult>,
    /// Upload time
    pub created_at: DateTime<Utc>,
    /// Settlement time, stamped when the status snaps
    pub processed_at: Option<DateTime<Utc>>,
}

impl BulkFile {
    /// Validate a submission and create the file in Processing
    ///
    /// Item verdicts, counts, total amount and the target status are all
    /// fixed here. A file whose declared digest does not match its items is
    /// refused outright; no aggregate is created for content that did not
    /// arrive intact.
    pub fn intake(
        id: FileId,
        participant: ParticipantId,
        idempotency_key: IdempotencyKey,
        request_hash: RequestHash,
        submission: &BulkSubmission,
        max_items: usize,
    ) -> Result<Self, GatewayError> {
        if submission.items.is_empty() {
            return Err(GatewayError::validation(
                "bulk_empty",
                "bulk file must contain at least one item",
            ));
        }
        if submission.items.len() > max_items {
            return Err(GatewayError::validation(
                "bulk_too_large",
                format!(
                    "bulk file has {} items, limit is {max_items}",
                    submission.items.len()
                ),
            ));
        }
        if let IntegrityMode::DeclaredSha256 { digest } = &submission.integrity {
            let computed = items_digest(&submission.items)?;
            if computed != *digest {
                return Err(GatewayError::validation(
                    "bulk_integrity_mismatch",
                    "declared digest does not match the submitted items",
                ));
            }
        }

        let mut items = Vec::with_capacity(submission.items.len());
        let mut accepted: u32 = 0;
        let mut rejected: u32 = 0;
        let mut total_amount = Amount::ZERO;

        for item in &submission.items {
            let verdict = match validate_item(item) {
                Ok(()) => {
                    accepted += 1;
                    total_amount = total_amount.checked_add(item.amount).ok_or_else(|| {
                        GatewayError::validation(
                            "bulk_amount_overflow",
                            "accepted item amounts overflow the file total",
                        )
                    })?;
                    ItemVerdict::Accepted
                }
                Err(reason) => {
                    rejected += 1;
                    ItemVerdict::Rejected { reason }
                }
            };
            items.push(BulkItemResult {
                end_to_end_id: item.end_to_end_id.clone(),
                verdict,
            });
        }

        let total = accepted + rejected;
        let target_status = if rejected == 0 {
            BulkFileStatus::Completed
        } else if accepted == 0 {
            BulkFileStatus::Rejected
        } else {
            BulkFileStatus::PartiallyAccepted
        };

        Ok(Self {
            id,
            consent: submission.consent.clone(),
            participant,
            idempotency_key,
            request_hash,
            integrity: submission.integrity.clone(),
            status: BulkFileStatus::Processing,
            target_status,
            poll_count: 0,
            total_items: total,
            accepted_items: accepted,
            rejected_items: rejected,
            total_amount,
            items,
            created_at: Utc::now(),
            processed_at: None,
        })
    }

    /// One settlement poll
    ///
    /// No-op on a settled file. Otherwise bumps the poll count; at the
    /// threshold the status snaps to the intake-time target and
    /// `processed_at` is stamped.
    pub fn advance_processing(
        &mut self,
        poll_threshold: u32,
        now: DateTime<Utc>,
    ) -> AdvanceOutcome {
        if self.status.is_terminal() {
            return AdvanceOutcome::AlreadyTerminal {
                status: self.status,
            };
        }
        self.poll_count += 1;
        if self.poll_count >= poll_threshold {
            self.status = self.target_status;
            self.processed_at = Some(now);
            AdvanceOutcome::Settled {
                status: self.status,
            }
        } else {
            AdvanceOutcome::Processing {
                poll_count: self.poll_count,
            }
        }
    }

    /// Point-in-time status report
    ///
    /// Pure projection. Items accepted at intake render Pending until the
    /// file settles; rejections are visible immediately.
    pub fn report(&self, now: DateTime<Utc>) -> BulkFileReport {
        let terminal = self.status.is_terminal();
        let items = self
            .items
            .iter()
            .map(|item| match &item.verdict {
                ItemVerdict::Accepted => ReportedItem {
                    end_to_end_id: item.end_to_end_id.clone(),
                    status: if terminal {
                        ReportedItemStatus::Accepted
                    } else {
                        ReportedItemStatus::Pending
                    },
                    reason: None,
                },
                ItemVerdict::Rejected { reason } => ReportedItem {
                    end_to_end_id: item.end_to_end_id.clone(),
                    status: ReportedItemStatus::Rejected,
                    reason: Some(reason.clone()),
                },
            })
            .collect();

        BulkFileReport {
            file_id: self.id.clone(),
            status: self.status,
            total_items: self.total_items,
            accepted_items: self.accepted_items,
            rejected_items: self.rejected_items,
            total_amount: self.total_amount,
            items,
            generated_at: now,
        }
    }
}

fn validate_item(item: &BulkItemSubmission) -> Result<(), String> {
    if item.end_to_end_id.trim().is_empty() {
        return Err("missing end-to-end id".to_string());
    }
    if !item.amount.is_positive() {
        return Err("amount must be positive".to_string());
    }
    if let Err(e) = Iban::parse(&item.creditor_iban) {
        return Err(format!("creditor account invalid: {e}"));
    }
    Ok(())
}

/// Item status as rendered in a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedItemStatus {
    /// Accepted at intake, settlement not yet confirmed
    Pending,
    /// Settled with the file
    Accepted,
    /// Rejected at intake
    Rejected,
}

/// One item line in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedItem {
    /// Submitter's end-to-end reference
    pub end_to_end_id: String,
    /// Rendered status
    pub status: ReportedItemStatus,
    /// Rejection reason, when rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Point-in-time projection of a bulk file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkFileReport {
    /// File identifier
    pub file_id: FileId,
    /// Status at generation time
    pub status: BulkFileStatus,
    /// Items submitted
    pub total_items: u32,
    /// Items accepted at intake
    pub accepted_items: u32,
    /// Items rejected at intake
    pub rejected_items: u32,
    /// Sum of accepted item amounts
    pub total_amount: Amount,
    /// Per-item lines in submission order
    pub items: Vec<ReportedItem>,
    /// Generation time
    pub generated_at: DateTime<Utc>,
}

/// Storage for bulk file aggregates
///
/// `advance` runs the poll inside the store so each file has a single
/// writer path; `None` means the file id is unknown.
#[async_trait]
pub trait BulkFileStore: Send + Sync + std::fmt::Debug {
    /// Store a freshly taken-in file
    async fn insert(&self, file: BulkFile) -> Result<(), StoreError>;

    /// Load a file by id
    async fn get(&self, id: &FileId) -> Result<Option<BulkFile>, StoreError>;

    /// Apply one settlement poll to a stored file
    async fn advance(
        &self,
        id: &FileId,
        poll_threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<AdvanceOutcome>, StoreError>;
}

/// In-memory bulk file store for tests and development
#[derive(Debug, Default)]
pub struct MemoryBulkFileStore {
    files: DashMap<FileId, BulkFile>,
}

impl MemoryBulkFileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BulkFileStore for MemoryBulkFileStore {
    async fn insert(&self, file: BulkFile) -> Result<(), StoreError> {
        self.files.insert(file.id.clone(), file);
        Ok(())
    }

    async fn get(&self, id: &FileId) -> Result<Option<BulkFile>, StoreError> {
        Ok(self.files.get(id).map(|e| e.value().clone()))
    }

    async fn advance(
        &self,
        id: &FileId,
        poll_threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<AdvanceOutcome>, StoreError> {
        // Entry lock serializes polls per file
        Ok(self
            .files
            .get_mut(id)
            .map(|mut entry| entry.advance_processing(poll_threshold, now)))
    }
}
