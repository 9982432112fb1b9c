//! Command flows behind the gate.
//!
//! Flows run after a request has crossed the security gate: domain checks,
//! execution and idempotent commit live here. The commit discipline is the
//! one the idempotency contract demands: domain rejections are committed so
//! a duplicate replays the exact rejection bytes, infrastructure failures
//! release the claim so the next arrival executes fresh. Domain events
//! publish after a successful commit and never on replay, so one execution
//! produces exactly one event.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use fapigate_core::store::StoreError;
use fapigate_core::{
    AccountId, Amount, ConsentId, CustomerId, FileId, GatewayError, Iban, IdempotencyKey,
    OperationId, ParticipantId, RequestHash, ScopeSet,
};

use crate::bulk::{AdvanceOutcome, BulkFile, BulkFileReport, BulkFileStore, BulkSubmission};
use crate::config::BulkConfig;
use crate::consent::{
    CasOutcome, Consent, ConsentError, ConsentEvent, ConsentStore, CorporateConsentContext,
};
use crate::events::{BulkFileEvent, DomainEvent, EventSink, PaymentEvent};
use crate::gate::{Admission, GatewayOperation};
use crate::idempotency::{IdempotencyCoordinator, Resolution, StoredResponse};

/// Scope each operation demands from the consent it runs under
static REQUIRED_SCOPES: Lazy<HashMap<GatewayOperation, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (GatewayOperation::AccountAccess, "accounts"),
        (GatewayOperation::PaymentSubmit, "payments"),
        (GatewayOperation::BulkSubmit, "payments"),
        (GatewayOperation::BulkReport, "payments"),
    ])
});

/// Scope an operation requires, `None` for consent management itself
pub fn required_scope(operation: GatewayOperation) -> Option<&'static str> {
    REQUIRED_SCOPES.get(&operation).copied()
}

/// Attempts before a consent mutation gives up under write contention
const CAS_ATTEMPTS: usize = 4;

/// Consent lifecycle commands and reads
#[derive(Debug)]
pub struct ConsentFlow {
    store: Arc<dyn ConsentStore>,
    events: Arc<dyn EventSink>,
}

impl ConsentFlow {
    /// Build a flow over a consent store and event sink
    pub fn new(store: Arc<dyn ConsentStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Create a consent in Pending
    pub async fn create(
        &self,
        participant: ParticipantId,
        customer: CustomerId,
        scopes: ScopeSet,
        purpose: impl Into<String>,
        expires_at: DateTime<Utc>,
        corporate: Option<CorporateConsentContext>,
    ) -> Result<Consent, GatewayError> {
        let (consent, event) = Consent::create(
            ConsentId::generate(),
            participant,
            customer,
            scopes,
            purpose,
            expires_at,
            corporate,
        )?;
        self.store
            .insert(consent.clone())
            .await
            .map_err(consent_store_unavailable)?;
        publish_best_effort(&*self.events, event.into()).await;
        Ok(consent)
    }

    /// Load a consent
    pub async fn get(&self, id: &ConsentId) -> Result<Consent, GatewayError> {
        self.store
            .get(id)
            .await
            .map_err(consent_store_unavailable)?
            .ok_or_else(|| GatewayError::not_found(format!("consent {id}")))
    }

    /// Customer authorizes a pending consent
    pub async fn authorize(&self, id: &ConsentId) -> Result<Consent, GatewayError> {
        self.mutate(id, Consent::authorize).await
    }

    /// Withdraw a consent
    pub async fn revoke(
        &self,
        id: &ConsentId,
        reason: impl Into<String>,
    ) -> Result<Consent, GatewayError> {
        let reason = reason.into();
        self.mutate(id, move |consent| consent.revoke(reason.clone()))
            .await
    }

    /// Extend an authorized consent
    pub async fn renew(
        &self,
        id: &ConsentId,
        expires_at: DateTime<Utc>,
    ) -> Result<Consent, GatewayError> {
        self.mutate(id, move |consent| consent.renew(expires_at)).await
    }

    /// Apply a transition under optimistic concurrency
    ///
    /// Reload and retry on version mismatch; the event publishes only for
    /// the attempt whose write won.
    async fn mutate<F>(&self, id: &ConsentId, apply: F) -> Result<Consent, GatewayError>
    where
        F: Fn(&mut Consent) -> Result<ConsentEvent, ConsentError>,
    {
        for _ in 0..CAS_ATTEMPTS {
            let mut consent = self.get(id).await?;
            let expected = consent.version;
            let event = apply(&mut consent)?;
            match self
                .store
                .compare_and_update(consent.clone(), expected)
                .await
                .map_err(consent_store_unavailable)?
            {
                CasOutcome::Updated => {
                    publish_best_effort(&*self.events, event.into()).await;
                    return Ok(consent);
                }
                CasOutcome::VersionMismatch => continue,
            }
        }
        Err(GatewayError::state_conflict(
            "consent_contention",
            "consent was updated concurrently; retry",
        ))
    }
}

/// A single payment instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSubmission {
    /// Consent the payment runs under
    pub consent: ConsentId,
    /// Debtor account, required under a restricted corporate consent
    pub debtor_account: Option<AccountId>,
    /// Creditor account
    pub creditor_iban: String,
    /// Instructed amount in minor units
    pub amount: Amount,
    /// Submitter's reference
    pub reference: String,
}

/// Response body of an executed payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReceipt {
    /// Operation produced by the execution
    pub operation_id: OperationId,
    /// Consent the payment ran under
    pub consent: ConsentId,
    /// Instructed amount
    pub amount: Amount,
    /// Settlement status at acceptance
    pub status: String,
}

/// Response body of an accepted bulk file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkReceipt {
    /// Operation produced by the intake
    pub operation_id: OperationId,
    /// File identifier for status polling
    pub file_id: FileId,
    /// Items taken in
    pub total_items: u32,
    /// File status at acceptance
    pub status: String,
}

/// Payment and bulk file commands
#[derive(Debug)]
pub struct PaymentFlow {
    bulk_config: BulkConfig,
    coordinator: IdempotencyCoordinator,
    consents: Arc<dyn ConsentStore>,
    files: Arc<dyn BulkFileStore>,
    events: Arc<dyn EventSink>,
}

impl PaymentFlow {
    /// Build a flow over its stores and collaborators
    pub fn new(
        bulk_config: BulkConfig,
        coordinator: IdempotencyCoordinator,
        consents: Arc<dyn ConsentStore>,
        files: Arc<dyn BulkFileStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            bulk_config,
            coordinator,
            consents,
            files,
            events,
        }
    }

    /// Submit a single payment under an admission
    ///
    /// Duplicates replay the stored bytes without executing; the response
    /// carries the replay flag so hosts can set the indicator header.
    pub async fn submit_payment(
        &self,
        admission: &Admission,
        submission: &PaymentSubmission,
    ) -> Result<StoredResponse, GatewayError> {
        let key = require_key(admission)?;
        let hash = RequestHash::of(submission)?;

        let ticket = match self
            .coordinator
            .resolve(&admission.participant, key, &hash)
            .await?
        {
            Resolution::Replay(stored) => return Ok(stored),
            Resolution::Fresh(ticket) => ticket,
        };

        match self.execute_payment(admission, submission).await {
            Ok((body, operation_id, event)) => {
                let stored = self
                    .coordinator
                    .commit(ticket, 201, body, operation_id)
                    .await?;
                publish_best_effort(&*self.events, event).await;
                Ok(stored)
            }
            Err(err) if matches!(err, GatewayError::DependencyUnavailable { .. }) => {
                self.coordinator.release(ticket).await?;
                Err(err)
            }
            Err(err) => {
                // Commit the rejection so a duplicate replays it byte for byte
                let body = Bytes::from(err.response_body().to_string());
                self.coordinator
                    .commit(ticket, err.http_status(), body, OperationId::generate())
                    .await?;
                Err(err)
            }
        }
    }

    /// Upload a bulk payment file under an admission
    pub async fn submit_bulk_file(
        &self,
        admission: &Admission,
        submission: &BulkSubmission,
    ) -> Result<StoredResponse, GatewayError> {
        let key = require_key(admission)?;
        let hash = RequestHash::of(submission)?;

        let ticket = match self
            .coordinator
            .resolve(&admission.participant, key, &hash)
            .await?
        {
            Resolution::Replay(stored) => return Ok(stored),
            Resolution::Fresh(ticket) => ticket,
        };

        match self.execute_bulk(admission, submission, key.clone(), hash).await {
            Ok((body, operation_id, event)) => {
                let stored = self
                    .coordinator
                    .commit(ticket, 202, body, operation_id)
                    .await?;
                publish_best_effort(&*self.events, event).await;
                Ok(stored)
            }
            Err(err) if matches!(err, GatewayError::DependencyUnavailable { .. }) => {
                self.coordinator.release(ticket).await?;
                Err(err)
            }
            Err(err) => {
                let body = Bytes::from(err.response_body().to_string());
                self.coordinator
                    .commit(ticket, err.http_status(), body, OperationId::generate())
                    .await?;
                Err(err)
            }
        }
    }

    /// One settlement poll, the worker entry point
    pub async fn advance_bulk_file(&self, id: &FileId) -> Result<AdvanceOutcome, GatewayError> {
        let outcome = self
            .files
            .advance(id, self.bulk_config.poll_threshold, Utc::now())
            .await
            .map_err(file_store_unavailable)?
            .ok_or_else(|| GatewayError::not_found(format!("bulk file {id}")))?;

        if let AdvanceOutcome::Settled { status } = outcome {
            tracing::info!(file = %id, status = %status, "bulk file settled");
            publish_best_effort(
                &*self.events,
                BulkFileEvent::Settled {
                    file_id: id.clone(),
                    status,
                    at: Utc::now(),
                }
                .into(),
            )
            .await;
        }
        Ok(outcome)
    }

    /// Point-in-time report for a bulk file
    pub async fn bulk_report(&self, id: &FileId) -> Result<BulkFileReport, GatewayError> {
        let file = self
            .files
            .get(id)
            .await
            .map_err(file_store_unavailable)?
            .ok_or_else(|| GatewayError::not_found(format!("bulk file {id}")))?;
        Ok(file.report(Utc::now()))
    }

    async fn execute_payment(
        &self,
        admission: &Admission,
        submission: &PaymentSubmission,
    ) -> Result<(Bytes, OperationId, DomainEvent), GatewayError> {
        let consent = self.active_consent(admission, &submission.consent).await?;

        if let Some(corporate) = &consent.corporate {
            match &submission.debtor_account {
                Some(account) if !corporate.allows_account(account) => {
                    return Err(GatewayError::forbidden(
                        "account_not_permitted",
                        "debtor account is outside the consented account set",
                    ));
                }
                None if corporate.requires_named_account() => {
                    return Err(GatewayError::validation(
                        "missing_debtor_account",
                        "restricted corporate consent requires a debtor account",
                    ));
                }
                _ => {}
            }
        }

        Iban::parse(&submission.creditor_iban)?;
        if !submission.amount.is_positive() {
            return Err(GatewayError::validation(
                "invalid_amount",
                "payment amount must be positive",
            ));
        }

        let operation_id = OperationId::generate();
        let receipt = PaymentReceipt {
            operation_id: operation_id.clone(),
            consent: consent.id.clone(),
            amount: submission.amount,
            status: "accepted".to_string(),
        };
        let body = serialize_receipt(&receipt)?;
        let event = PaymentEvent::Executed {
            operation_id: operation_id.clone(),
            consent: consent.id,
            participant: admission.participant.clone(),
            debtor_account: submission.debtor_account.clone(),
            amount: submission.amount,
            at: Utc::now(),
        }
        .into();
        Ok((body, operation_id, event))
    }

    async fn execute_bulk(
        &self,
        admission: &Admission,
        submission: &BulkSubmission,
        key: IdempotencyKey,
        hash: RequestHash,
    ) -> Result<(Bytes, OperationId, DomainEvent), GatewayError> {
        let consent = self.active_consent(admission, &submission.consent).await?;

        let file = BulkFile::intake(
            FileId::generate(),
            admission.participant.clone(),
            key,
            hash,
            submission,
            self.bulk_config.max_items,
        )?;
        let receipt = BulkReceipt {
            operation_id: OperationId::generate(),
            file_id: file.id.clone(),
            total_items: file.total_items,
            status: file.status.to_string(),
        };
        let event = BulkFileEvent::Received {
            file_id: file.id.clone(),
            consent: consent.id,
            participant: admission.participant.clone(),
            total_items: file.total_items,
            at: file.created_at,
        }
        .into();

        let body = serialize_receipt(&receipt)?;
        self.files
            .insert(file)
            .await
            .map_err(file_store_unavailable)?;
        Ok((body, receipt.operation_id, event))
    }

    /// Load a consent and require it to authorize this admission's operation
    async fn active_consent(
        &self,
        admission: &Admission,
        id: &ConsentId,
    ) -> Result<Consent, GatewayError> {
        let consent = self
            .consents
            .get(id)
            .await
            .map_err(consent_store_unavailable)?
            .ok_or_else(|| GatewayError::not_found(format!("consent {id}")))?;

        if consent.participant != admission.participant {
            tracing::warn!(
                participant = %admission.participant,
                owner = %consent.participant,
                "consent presented by a different participant"
            );
            return Err(GatewayError::forbidden(
                "consent_wrong_participant",
                "consent belongs to a different participant",
            ));
        }
        if !consent.is_active() {
            return Err(GatewayError::forbidden(
                "consent_not_active",
                format!("consent is {}", consent.status),
            ));
        }
        if let Some(scope) = required_scope(admission.operation) {
            if !consent.scopes.has_scope(scope) {
                return Err(GatewayError::forbidden(
                    "consent_scope_missing",
                    format!("consent does not grant the '{scope}' scope"),
                ));
            }
        }
        Ok(consent)
    }
}

fn require_key(admission: &Admission) -> Result<&IdempotencyKey, GatewayError> {
    admission.idempotency_key.as_ref().ok_or_else(|| {
        GatewayError::validation(
            "missing_idempotency_key",
            "command admissions must carry an idempotency key",
        )
    })
}

fn serialize_receipt<T: Serialize>(receipt: &T) -> Result<Bytes, GatewayError> {
    serde_json::to_vec(receipt)
        .map(Bytes::from)
        .map_err(|e| GatewayError::dependency_unavailable(format!("receipt serialization: {e}")))
}

async fn publish_best_effort(sink: &dyn EventSink, event: DomainEvent) {
    if let Err(e) = sink.publish(event).await {
        tracing::warn!(error = %e, "event sink rejected domain event");
    }
}

fn consent_store_unavailable(e: StoreError) -> GatewayError {
    GatewayError::dependency_unavailable(format!("consent store: {e}"))
}

fn file_store_unavailable(e: StoreError) -> GatewayError {
    GatewayError::dependency_unavailable(format!("bulk file store: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_table_covers_data_and_payment_surfaces() {
        assert_eq!(
            required_scope(GatewayOperation::AccountAccess),
            Some("accounts")
        );
        assert_eq!(
            required_scope(GatewayOperation::PaymentSubmit),
            Some("payments")
        );
        assert_eq!(required_scope(GatewayOperation::BulkSubmit), Some("payments"));
        // Consent management is authorized by the flow itself, not a scope
        assert_eq!(required_scope(GatewayOperation::ConsentAuthorize), None);
        assert_eq!(required_scope(GatewayOperation::ConsentRevoke), None);
    }
}
