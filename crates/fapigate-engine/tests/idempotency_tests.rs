//! Duplicate-delivery behavior across the coordinator and the payment flow.
//!
//! The contract under test: for any (participant, idempotency key) scope,
//! at most one execution happens, and every duplicate receives the bytes
//! the first execution committed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use pretty_assertions::assert_eq;

use fapigate_core::{
    Amount, ConsentId, CustomerId, GatewayError, IdempotencyKey, InteractionId, OperationId,
    ParticipantId, RequestHash, ScopeSet, StoreError,
};
use fapigate_engine::bulk::MemoryBulkFileStore;
use fapigate_engine::config::{BulkConfig, IdempotencyConfig};
use fapigate_engine::consent::{CasOutcome, Consent, ConsentStore, MemoryConsentStore};
use fapigate_engine::events::{DomainEvent, MemoryEventSink};
use fapigate_engine::flows::{ConsentFlow, PaymentFlow, PaymentSubmission};
use fapigate_engine::gate::{Admission, GatewayOperation};
use fapigate_engine::idempotency::{IdempotencyCoordinator, MemoryIdempotencyStore, Resolution};

const GOOD_IBAN: &str = "DE89370400440532013000";

fn tpp() -> ParticipantId {
    ParticipantId::new("tpp-001").unwrap()
}

fn admission(participant: ParticipantId, key: Option<&str>) -> Admission {
    Admission {
        interaction_id: InteractionId::generate(),
        participant,
        operation: GatewayOperation::PaymentSubmit,
        idempotency_key: key.map(|k| IdempotencyKey::new(k).unwrap()),
        proof: None,
        admitted_at: Utc::now(),
    }
}

struct Fixture {
    consents: ConsentFlow,
    payments: PaymentFlow,
    events: Arc<MemoryEventSink>,
}

fn fixture_over(consent_store: Arc<dyn ConsentStore>) -> Fixture {
    let events = Arc::new(MemoryEventSink::new());
    let coordinator = IdempotencyCoordinator::new(
        IdempotencyConfig::default(),
        Arc::new(MemoryIdempotencyStore::new()),
    );
    Fixture {
        consents: ConsentFlow::new(Arc::clone(&consent_store), events.clone()),
        payments: PaymentFlow::new(
            BulkConfig::default(),
            coordinator,
            consent_store,
            Arc::new(MemoryBulkFileStore::new()),
            events.clone(),
        ),
        events,
    }
}

fn fixture() -> Fixture {
    fixture_over(Arc::new(MemoryConsentStore::new()))
}

async fn authorized_consent(fx: &Fixture, participant: &ParticipantId) -> ConsentId {
    let consent = fx
        .consents
        .create(
            participant.clone(),
            CustomerId::new("psu-77").unwrap(),
            ScopeSet::from_raw(["payments", "accounts"]),
            "payment initiation",
            Utc::now() + ChronoDuration::days(1),
            None,
        )
        .await
        .unwrap();
    fx.consents.authorize(&consent.id).await.unwrap();
    consent.id
}

fn payment(consent: &ConsentId) -> PaymentSubmission {
    PaymentSubmission {
        consent: consent.clone(),
        debtor_account: None,
        creditor_iban: GOOD_IBAN.to_string(),
        amount: Amount::from_minor_units(12_500),
        reference: "invoice 2026-118".to_string(),
    }
}

fn payment_events(events: &MemoryEventSink) -> usize {
    events
        .events()
        .iter()
        .filter(|e| matches!(e, DomainEvent::Payment(_)))
        .count()
}

/// Eight arrivals race the same scope; exactly one executes.
#[tokio::test]
async fn test_parallel_duplicates_execute_once() {
    let coordinator = Arc::new(IdempotencyCoordinator::new(
        IdempotencyConfig::default(),
        Arc::new(MemoryIdempotencyStore::new()),
    ));
    let executions = Arc::new(AtomicUsize::new(0));
    let participant = tpp();
    let key = IdempotencyKey::new("transfer-42").unwrap();
    let hash = RequestHash::of(&serde_json::json!({"amount": 2500})).unwrap();

    let tasks = (0..8).map(|_| {
        let coordinator = Arc::clone(&coordinator);
        let executions = Arc::clone(&executions);
        let participant = participant.clone();
        let key = key.clone();
        let hash = hash.clone();
        tokio::spawn(async move {
            match coordinator.resolve(&participant, &key, &hash).await.unwrap() {
                Resolution::Fresh(ticket) => {
                    executions.fetch_add(1, Ordering::SeqCst);
                    // Hold the claim briefly so the others have to wait
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    coordinator
                        .commit(
                            ticket,
                            201,
                            Bytes::from_static(b"{\"status\":\"settled\"}"),
                            OperationId::generate(),
                        )
                        .await
                        .unwrap()
                }
                Resolution::Replay(stored) => stored,
            }
        })
    });

    let responses: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    let replays = responses.iter().filter(|r| r.replayed).count();
    assert_eq!(replays, 7);
    for response in &responses {
        assert_eq!(response.status, 201);
        assert_eq!(response.body, Bytes::from_static(b"{\"status\":\"settled\"}"));
    }
}

#[tokio::test]
async fn test_duplicate_payment_served_from_store() {
    let fx = fixture();
    let participant = tpp();
    let consent = authorized_consent(&fx, &participant).await;
    let submission = payment(&consent);
    let admitted = admission(participant, Some("pay-2026-001"));

    let first = fx.payments.submit_payment(&admitted, &submission).await.unwrap();
    assert_eq!(first.status, 201);
    assert!(!first.replayed);

    let second = fx.payments.submit_payment(&admitted, &submission).await.unwrap();
    assert!(second.replayed);
    assert_eq!(second.status, first.status);
    assert_eq!(second.body, first.body);
    assert_eq!(second.operation_id, first.operation_id);

    // One consent created + authorized, one payment executed, no more
    assert_eq!(payment_events(&fx.events), 1);
}

#[tokio::test]
async fn test_rejected_submission_replays_the_rejection() {
    let fx = fixture();
    let participant = tpp();
    let consent = authorized_consent(&fx, &participant).await;

    let mut submission = payment(&consent);
    submission.amount = Amount::ZERO;
    let admitted = admission(participant, Some("pay-2026-002"));

    let err = fx
        .payments
        .submit_payment(&admitted, &submission)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_amount");
    assert_eq!(err.http_status(), 400);

    // The duplicate gets the stored rejection bytes, not a second evaluation
    let replay = fx
        .payments
        .submit_payment(&admitted, &submission)
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.status, 400);
    assert_eq!(
        replay.body,
        Bytes::from(err.response_body().to_string())
    );
    assert_eq!(payment_events(&fx.events), 0);
}

#[tokio::test]
async fn test_conflicting_bytes_under_one_key_are_refused() {
    let fx = fixture();
    let participant = tpp();
    let consent = authorized_consent(&fx, &participant).await;
    let admitted = admission(participant, Some("pay-2026-003"));

    fx.payments
        .submit_payment(&admitted, &payment(&consent))
        .await
        .unwrap();

    let mut altered = payment(&consent);
    altered.amount = Amount::from_minor_units(999_999);
    let err = fx
        .payments
        .submit_payment(&admitted, &altered)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "idempotency_conflict");
    assert_eq!(err.http_status(), 409);
    assert!(!err.is_retryable());
    assert_eq!(payment_events(&fx.events), 1);
}

#[tokio::test]
async fn test_participants_do_not_share_idempotency_scopes() {
    let fx = fixture();
    let tpp_a = tpp();
    let tpp_b = ParticipantId::new("tpp-002").unwrap();
    let consent_a = authorized_consent(&fx, &tpp_a).await;
    let consent_b = authorized_consent(&fx, &tpp_b).await;

    let first = fx
        .payments
        .submit_payment(&admission(tpp_a, Some("shared-key")), &payment(&consent_a))
        .await
        .unwrap();
    let second = fx
        .payments
        .submit_payment(&admission(tpp_b, Some("shared-key")), &payment(&consent_b))
        .await
        .unwrap();

    assert!(!first.replayed);
    assert!(!second.replayed);
    assert_ne!(first.operation_id, second.operation_id);
    assert_eq!(payment_events(&fx.events), 2);
}

/// Consent store that fails a set number of reads before recovering.
#[derive(Debug)]
struct FlakyConsentStore {
    inner: MemoryConsentStore,
    failures_left: AtomicUsize,
}

#[async_trait::async_trait]
impl ConsentStore for FlakyConsentStore {
    async fn insert(&self, consent: Consent) -> Result<(), StoreError> {
        self.inner.insert(consent).await
    }

    async fn get(&self, id: &ConsentId) -> Result<Option<Consent>, StoreError> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::unavailable("consent store offline"));
        }
        self.inner.get(id).await
    }

    async fn compare_and_update(
        &self,
        consent: Consent,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError> {
        self.inner.compare_and_update(consent, expected_version).await
    }
}

#[tokio::test]
async fn test_infrastructure_failure_releases_the_claim() {
    let store = Arc::new(FlakyConsentStore {
        inner: MemoryConsentStore::new(),
        failures_left: AtomicUsize::new(0),
    });
    let fx = fixture_over(store.clone());
    let participant = tpp();
    let consent = authorized_consent(&fx, &participant).await;
    let submission = payment(&consent);
    let admitted = admission(participant, Some("pay-2026-004"));

    // First attempt hits a dead consent store
    store.failures_left.store(1, Ordering::SeqCst);
    let err = fx
        .payments
        .submit_payment(&admitted, &submission)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::DependencyUnavailable { .. }));
    assert!(err.is_retryable());

    // The claim was released, so the retry executes fresh instead of
    // replaying the outage or reporting the key as still pending
    let retried = fx
        .payments
        .submit_payment(&admitted, &submission)
        .await
        .unwrap();
    assert_eq!(retried.status, 201);
    assert!(!retried.replayed);
    assert_eq!(payment_events(&fx.events), 1);
}

#[tokio::test]
async fn test_missing_key_on_command_is_refused() {
    let fx = fixture();
    let participant = tpp();
    let consent = authorized_consent(&fx, &participant).await;

    let err = fx
        .payments
        .submit_payment(&admission(participant, None), &payment(&consent))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "missing_idempotency_key");
}
