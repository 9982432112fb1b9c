//! End-to-end walk through the fapigate trust boundary.
//!
//! Wires the security gate and the consent, payment and bulk flows over
//! in-memory stores, then drives the scenarios a conformance suite would:
//! a full consent passage with PKCE and a pushed request, duplicate payment
//! deliveries, a conflicting retry, proof replay and a bulk file with a
//! bad item.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use chrono::{Duration as ChronoDuration, Utc};

use fapigate_core::audit::MemoryAuditSink;
use fapigate_core::store::MemoryTtlStore;
use fapigate_core::{Amount, CustomerId, GatewayError, InteractionId, ParticipantId, ScopeSet};
use fapigate_dpop::{DpopAlgorithm, KeyPair, ProofRequest, ProofSigner};
use fapigate_engine::bulk::{
    AdvanceOutcome, BulkItemSubmission, BulkSubmission, IntegrityMode, MemoryBulkFileStore,
};
use fapigate_engine::config::{GatewayConfigBuilder, IdempotencyConfig};
use fapigate_engine::consent::MemoryConsentStore;
use fapigate_engine::events::MemoryEventSink;
use fapigate_engine::flows::{BulkReceipt, ConsentFlow, PaymentFlow, PaymentSubmission};
use fapigate_engine::gate::{Authorization, GateRequest, GatewayOperation, SecurityGate};
use fapigate_engine::idempotency::{IdempotencyCoordinator, MemoryIdempotencyStore};
use fapigate_engine::mtls::{ClientCertificate, MemoryCertificateDirectory};
use fapigate_engine::pkce::{
    derive_challenge, MemoryPushedRequestRegistry, PkceChallenge, PushedRequest,
    PushedRequestRegistry,
};

const BASE: &str = "https://api.bank.example";
const ACCESS_TOKEN: &str = "at-demo-7f3a";
const GOOD_IBAN: &str = "DE89370400440532013000";
const BAD_IBAN: &str = "GB82WEST12345698765431";

struct Demo {
    gate: SecurityGate,
    consents: ConsentFlow,
    payments: PaymentFlow,
    pushed: Arc<MemoryPushedRequestRegistry>,
    audit: Arc<MemoryAuditSink>,
    signer: ProofSigner,
    participant: ParticipantId,
    certificate: ClientCertificate,
}

impl Demo {
    fn new() -> anyhow::Result<Self> {
        let participant = ParticipantId::new("tpp-demo-001")?;
        let certificate = ClientCertificate {
            subject: "CN=tpp-demo-001,O=Demo TPP Ltd".to_string(),
            issuer: "CN=open-finance-directory-ca".to_string(),
            fingerprint_sha256: "deadbeef".repeat(8),
            not_before: Utc::now() - ChronoDuration::days(30),
            not_after: Utc::now() + ChronoDuration::days(335),
        };

        let directory = Arc::new(MemoryCertificateDirectory::new());
        directory.trust(certificate.fingerprint_sha256.clone());

        let pushed = Arc::new(MemoryPushedRequestRegistry::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let gate = SecurityGate::new(
            GatewayConfigBuilder::new().build(),
            Arc::new(MemoryTtlStore::new()),
            directory,
            pushed.clone(),
            audit.clone(),
        );

        let consent_store = Arc::new(MemoryConsentStore::new());
        let events = Arc::new(MemoryEventSink::new());
        let coordinator = IdempotencyCoordinator::new(
            IdempotencyConfig::default(),
            Arc::new(MemoryIdempotencyStore::new()),
        );
        let consents = ConsentFlow::new(consent_store.clone(), events.clone());
        let payments = PaymentFlow::new(
            Default::default(),
            coordinator,
            consent_store,
            Arc::new(MemoryBulkFileStore::new()),
            events,
        );

        Ok(Self {
            gate,
            consents,
            payments,
            pushed,
            audit,
            signer: ProofSigner::new(KeyPair::generate(DpopAlgorithm::ES256)?),
            participant,
            certificate,
        })
    }

    /// A request the way a host would build it from transport headers,
    /// carrying a freshly signed proof bound to the method and URL.
    fn request(
        &self,
        operation: GatewayOperation,
        method: &str,
        url: &str,
        idempotency_key: Option<&str>,
    ) -> anyhow::Result<GateRequest> {
        let compact = self
            .signer
            .sign(&ProofRequest::new(method, url).access_token(ACCESS_TOKEN))?;
        let mut request = GateRequest::new(operation, method, url, self.participant.clone())
            .interaction_id(InteractionId::generate().to_string())
            .customer_ip("198.51.100.7")
            .certificate(self.certificate.clone())
            .authorization(Authorization::Dpop {
                token: ACCESS_TOKEN.into(),
            })
            .proof(compact);
        if let Some(key) = idempotency_key {
            request = request.idempotency_key(key);
        }
        Ok(request)
    }
}

fn expect_code(result: Result<impl std::fmt::Debug, GatewayError>, code: &str) -> anyhow::Result<()> {
    match result {
        Err(err) if err.error_code() == code => {
            tracing::info!(code = code, status = err.http_status(), body = %err.response_body(), "refused as expected");
            Ok(())
        }
        Err(err) => bail!("expected {code}, got {}", err.error_code()),
        Ok(value) => bail!("expected {code}, got success: {value:?}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let demo = Demo::new()?;
    tracing::info!(participant = %demo.participant, "gateway assembled over in-memory stores");

    // Consent passage: create, then authorize behind PKCE and a pushed request
    let consents_url = format!("{BASE}/consents");
    demo.gate
        .validate(&demo.request(
            GatewayOperation::ConsentCreate,
            "POST",
            &consents_url,
            Some("demo-consent-1"),
        )?)
        .await?;
    let consent = demo
        .consents
        .create(
            demo.participant.clone(),
            CustomerId::new("psu-demo-42")?,
            ScopeSet::from_scope_string("payments accounts"),
            "payment initiation",
            Utc::now() + ChronoDuration::days(90),
            None,
        )
        .await?;
    tracing::info!(consent = %consent.id, status = %consent.status, "consent created");

    let verifier = "demo-code-verifier-with-plenty-of-entropy-0001";
    let challenge = derive_challenge(verifier);
    let pushed = PushedRequest::new(
        demo.participant.clone(),
        PkceChallenge::parse("S256", &challenge)?,
        Duration::from_secs(90),
    );
    let request_uri = pushed.request_uri.clone();
    demo.pushed.register(pushed).await?;

    let authorize_url = format!("{BASE}/consents/authorize");
    let request = demo
        .request(
            GatewayOperation::ConsentAuthorize,
            "POST",
            &authorize_url,
            Some("demo-consent-auth-1"),
        )?
        .pkce("S256", challenge.as_str())
        .par_request_uri(request_uri);
    demo.gate.validate(&request).await?;
    let consent = demo.consents.authorize(&consent.id).await?;
    tracing::info!(consent = %consent.id, status = %consent.status, "consent authorized through PKCE and pushed request");

    // Single payment, delivered twice under one idempotency key
    let payments_url = format!("{BASE}/payments");
    let submission = PaymentSubmission {
        consent: consent.id.clone(),
        debtor_account: None,
        creditor_iban: GOOD_IBAN.to_string(),
        amount: Amount::from_minor_units(250_00),
        reference: "demo invoice 118".to_string(),
    };

    let admission = demo
        .gate
        .validate(&demo.request(
            GatewayOperation::PaymentSubmit,
            "POST",
            &payments_url,
            Some("demo-pay-1"),
        )?)
        .await?;
    let first = demo.payments.submit_payment(&admission, &submission).await?;
    tracing::info!(
        status = first.status,
        operation = %first.operation_id,
        body = %String::from_utf8_lossy(&first.body),
        "payment executed"
    );

    let admission = demo
        .gate
        .validate(&demo.request(
            GatewayOperation::PaymentSubmit,
            "POST",
            &payments_url,
            Some("demo-pay-1"),
        )?)
        .await?;
    let replay = demo.payments.submit_payment(&admission, &submission).await?;
    ensure!(replay.replayed && replay.body == first.body);
    tracing::info!(operation = %replay.operation_id, "duplicate delivery served from the store, no second execution");

    // Same key, different bytes
    let admission = demo
        .gate
        .validate(&demo.request(
            GatewayOperation::PaymentSubmit,
            "POST",
            &payments_url,
            Some("demo-pay-1"),
        )?)
        .await?;
    let mut altered = submission.clone();
    altered.amount = Amount::from_minor_units(999_999);
    expect_code(
        demo.payments.submit_payment(&admission, &altered).await,
        "idempotency_conflict",
    )?;

    // Presenting one proof twice trips replay detection
    let replayed_request = demo.request(
        GatewayOperation::PaymentSubmit,
        "POST",
        &payments_url,
        Some("demo-pay-2"),
    )?;
    demo.gate.validate(&replayed_request).await?;
    expect_code(demo.gate.validate(&replayed_request).await, "proof_replayed")?;

    // Bulk file with one bad creditor account
    let bulk_url = format!("{BASE}/payments/bulk");
    let items: Vec<_> = (0..5)
        .map(|i| BulkItemSubmission {
            end_to_end_id: format!("demo-e2e-{i}"),
            creditor_iban: if i == 3 { BAD_IBAN } else { GOOD_IBAN }.to_string(),
            amount: Amount::from_minor_units(10_00 * (i + 1)),
        })
        .collect();
    let bulk = BulkSubmission {
        consent: consent.id.clone(),
        items,
        integrity: IntegrityMode::None,
    };

    let admission = demo
        .gate
        .validate(&demo.request(
            GatewayOperation::BulkSubmit,
            "POST",
            &bulk_url,
            Some("demo-bulk-1"),
        )?)
        .await?;
    let accepted = demo.payments.submit_bulk_file(&admission, &bulk).await?;
    let receipt: BulkReceipt =
        serde_json::from_slice(&accepted.body).context("bulk receipt body")?;
    tracing::info!(file = %receipt.file_id, items = receipt.total_items, "bulk file taken in");

    // Poll until the file settles
    for poll in 1..=5 {
        let outcome = demo.payments.advance_bulk_file(&receipt.file_id).await?;
        tracing::info!(poll, ?outcome, "settlement poll");
        if !matches!(outcome, AdvanceOutcome::Processing { .. }) {
            break;
        }
    }
    let report = demo.payments.bulk_report(&receipt.file_id).await?;
    tracing::info!(
        status = %report.status,
        accepted = report.accepted_items,
        rejected = report.rejected_items,
        total = %serde_json::to_string(&report.total_amount)?,
        "bulk file report"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    // Revocation closes the door for further payments
    let consent = demo.consents.revoke(&consent.id, "customer request").await?;
    tracing::info!(consent = %consent.id, reason = ?consent.revocation_reason, "consent revoked");

    let admission = demo
        .gate
        .validate(&demo.request(
            GatewayOperation::PaymentSubmit,
            "POST",
            &payments_url,
            Some("demo-pay-3"),
        )?)
        .await?;
    expect_code(
        demo.payments.submit_payment(&admission, &submission).await,
        "consent_not_active",
    )?;

    let events = demo.audit.events();
    let admitted = events.iter().filter(|e| e.outcome.is_admitted()).count();
    tracing::info!(
        total = events.len(),
        admitted,
        rejected = events.len() - admitted,
        "every gate decision left exactly one audit event"
    );
    Ok(())
}
