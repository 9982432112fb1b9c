//! Full-path tests: a signed request clears the gate and drives the payment
//! flow, with duplicate deliveries and binding violations along the way.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;

use fapigate_core::audit::MemoryAuditSink;
use fapigate_core::store::MemoryTtlStore;
use fapigate_core::{AccountId, Amount, ConsentId, CustomerId, ParticipantId, ScopeSet};
use fapigate_dpop::{DpopAlgorithm, KeyPair, ProofRequest, ProofSigner};
use fapigate_engine::bulk::MemoryBulkFileStore;
use fapigate_engine::config::{BulkConfig, GatewayConfigBuilder, IdempotencyConfig};
use fapigate_engine::consent::{CorporateConsentContext, CorporateTier, MemoryConsentStore};
use fapigate_engine::events::{DomainEvent, MemoryEventSink};
use fapigate_engine::flows::{ConsentFlow, PaymentFlow, PaymentSubmission};
use fapigate_engine::gate::{
    Admission, Authorization, GateRequest, GatewayOperation, SecurityGate,
};
use fapigate_engine::idempotency::{IdempotencyCoordinator, MemoryIdempotencyStore};
use fapigate_engine::mtls::MemoryCertificateDirectory;
use fapigate_engine::pkce::MemoryPushedRequestRegistry;

const PAYMENTS_URL: &str = "https://api.bank.example/payments";
const TOKEN: &str = "at-12345";
const GOOD_IBAN: &str = "DE89370400440532013000";

fn tpp() -> ParticipantId {
    ParticipantId::new("tpp-001").unwrap()
}

struct Stack {
    gate: SecurityGate,
    consents: ConsentFlow,
    payments: PaymentFlow,
    events: Arc<MemoryEventSink>,
}

fn stack() -> Stack {
    let config = GatewayConfigBuilder::new()
        .no_rate_limit()
        .require_certificate(false)
        .require_par(false)
        .build();
    let gate = SecurityGate::new(
        config,
        Arc::new(MemoryTtlStore::new()),
        Arc::new(MemoryCertificateDirectory::new()),
        Arc::new(MemoryPushedRequestRegistry::new()),
        Arc::new(MemoryAuditSink::new()),
    );

    let consent_store = Arc::new(MemoryConsentStore::new());
    let events = Arc::new(MemoryEventSink::new());
    let coordinator = IdempotencyCoordinator::new(
        IdempotencyConfig::default(),
        Arc::new(MemoryIdempotencyStore::new()),
    );
    Stack {
        gate,
        consents: ConsentFlow::new(consent_store.clone(), events.clone()),
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

fn signer() -> ProofSigner {
    ProofSigner::new(KeyPair::generate(DpopAlgorithm::ES256).unwrap())
}

/// Payment request carrying a freshly signed proof over the payments URL
fn signed_payment(signer: &ProofSigner, key: &str) -> GateRequest {
    let compact = signer
        .sign(&ProofRequest::new("POST", PAYMENTS_URL).access_token(TOKEN))
        .unwrap();
    GateRequest::new(GatewayOperation::PaymentSubmit, "POST", PAYMENTS_URL, tpp())
        .interaction_id(fapigate_core::InteractionId::generate().to_string())
        .idempotency_key(key)
        .authorization(Authorization::Dpop {
            token: TOKEN.into(),
        })
        .proof(compact)
}

async fn admit(stack: &Stack, signer: &ProofSigner, key: &str) -> Admission {
    stack
        .gate
        .validate(&signed_payment(signer, key))
        .await
        .unwrap()
}

async fn authorized_consent(
    stack: &Stack,
    participant: ParticipantId,
    scopes: ScopeSet,
    corporate: Option<CorporateConsentContext>,
) -> ConsentId {
    let consent = stack
        .consents
        .create(
            participant,
            CustomerId::new("psu-77").unwrap(),
            scopes,
            "payment initiation",
            Utc::now() + ChronoDuration::days(1),
            corporate,
        )
        .await
        .unwrap();
    stack.consents.authorize(&consent.id).await.unwrap();
    consent.id
}

fn payment(consent: &ConsentId) -> PaymentSubmission {
    PaymentSubmission {
        consent: consent.clone(),
        debtor_account: None,
        creditor_iban: GOOD_IBAN.to_string(),
        amount: Amount::from_minor_units(45_000),
        reference: "salary run 2026-08".to_string(),
    }
}

fn executed_payments(events: &MemoryEventSink) -> usize {
    events
        .events()
        .iter()
        .filter(|e| matches!(e, DomainEvent::Payment(_)))
        .count()
}

#[tokio::test]
async fn test_signed_payment_clears_gate_and_settles_once() {
    let st = stack();
    let signer = signer();
    let consent =
        authorized_consent(&st, tpp(), ScopeSet::from_raw(["payments"]), None).await;
    let submission = payment(&consent);

    // First delivery: proof validated, key claimed, payment executed
    let admission = admit(&st, &signer, "pay-e2e-1").await;
    assert_eq!(
        admission.proof.as_ref().unwrap().thumbprint,
        signer.key_pair().thumbprint()
    );
    let first = st
        .payments
        .submit_payment(&admission, &submission)
        .await
        .unwrap();
    assert_eq!(first.status, 201);
    assert!(!first.replayed);

    // Redelivery signs a fresh proof (the old jti is burned) but reuses
    // the idempotency key and body; it must not execute again
    let admission = admit(&st, &signer, "pay-e2e-1").await;
    let second = st
        .payments
        .submit_payment(&admission, &submission)
        .await
        .unwrap();
    assert!(second.replayed);
    assert_eq!(second.body, first.body);
    assert_eq!(second.operation_id, first.operation_id);
    assert_eq!(executed_payments(&st.events), 1);
}

#[tokio::test]
async fn test_proof_bound_to_another_endpoint_is_refused() {
    let st = stack();
    let signer = signer();

    let compact = signer
        .sign(&ProofRequest::new("POST", "https://api.bank.example/other").access_token(TOKEN))
        .unwrap();
    let request = GateRequest::new(GatewayOperation::PaymentSubmit, "POST", PAYMENTS_URL, tpp())
        .interaction_id(fapigate_core::InteractionId::generate().to_string())
        .idempotency_key("pay-e2e-2")
        .authorization(Authorization::Dpop {
            token: TOKEN.into(),
        })
        .proof(compact);

    let err = st.gate.validate(&request).await.unwrap_err();
    assert_eq!(err.error_code(), "proof_binding_mismatch");
    assert_eq!(err.http_status(), 401);
}

#[tokio::test]
async fn test_presenting_one_proof_twice_is_refused() {
    let st = stack();
    let signer = signer();

    let request = signed_payment(&signer, "pay-e2e-3");
    st.gate.validate(&request).await.unwrap();
    let err = st.gate.validate(&request).await.unwrap_err();
    assert_eq!(err.error_code(), "proof_replayed");
    assert_eq!(err.http_status(), 401);
}

#[tokio::test]
async fn test_consent_checks_gate_the_execution() {
    let st = stack();
    let signer = signer();

    // Scope too narrow for payments
    let accounts_only =
        authorized_consent(&st, tpp(), ScopeSet::from_raw(["accounts"]), None).await;
    let admission = admit(&st, &signer, "pay-e2e-4").await;
    let err = st
        .payments
        .submit_payment(&admission, &payment(&accounts_only))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "consent_scope_missing");
    assert_eq!(err.http_status(), 403);

    // Consent owned by a different participant
    let foreign = authorized_consent(
        &st,
        ParticipantId::new("tpp-002").unwrap(),
        ScopeSet::from_raw(["payments"]),
        None,
    )
    .await;
    let admission = admit(&st, &signer, "pay-e2e-5").await;
    let err = st
        .payments
        .submit_payment(&admission, &payment(&foreign))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "consent_wrong_participant");

    // Revoked consent
    let revoked =
        authorized_consent(&st, tpp(), ScopeSet::from_raw(["payments"]), None).await;
    st.consents.revoke(&revoked, "customer request").await.unwrap();
    let admission = admit(&st, &signer, "pay-e2e-6").await;
    let err = st
        .payments
        .submit_payment(&admission, &payment(&revoked))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "consent_not_active");
    assert_eq!(executed_payments(&st.events), 0);
}

#[tokio::test]
async fn test_restricted_corporate_consent_pins_debtor_accounts() {
    let st = stack();
    let signer = signer();
    let corporate = CorporateConsentContext {
        tier: CorporateTier::Restricted,
        allowed_accounts: BTreeSet::from([AccountId::new("acct-001").unwrap()]),
    };
    let consent = authorized_consent(
        &st,
        tpp(),
        ScopeSet::from_raw(["payments"]),
        Some(corporate),
    )
    .await;

    // Unlisted debtor account
    let mut submission = payment(&consent);
    submission.debtor_account = Some(AccountId::new("acct-999").unwrap());
    let admission = admit(&st, &signer, "pay-e2e-7").await;
    let err = st
        .payments
        .submit_payment(&admission, &submission)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "account_not_permitted");
    assert_eq!(err.http_status(), 403);

    // Restricted tier refuses to guess the debtor account
    let admission = admit(&st, &signer, "pay-e2e-8").await;
    let err = st
        .payments
        .submit_payment(&admission, &payment(&consent))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "missing_debtor_account");

    // A listed account goes through
    let mut submission = payment(&consent);
    submission.debtor_account = Some(AccountId::new("acct-001").unwrap());
    let admission = admit(&st, &signer, "pay-e2e-9").await;
    let receipt = st
        .payments
        .submit_payment(&admission, &submission)
        .await
        .unwrap();
    assert_eq!(receipt.status, 201);
    assert_eq!(executed_payments(&st.events), 1);
}
