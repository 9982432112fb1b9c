//! # fapigate engine
//!
//! The trust boundary and command engine of the fapigate Open Finance
//! gateway: everything between "a request arrived" and "an aggregate
//! changed", without any HTTP framework attached.
//!
//! A request crosses the [`gate::SecurityGate`] first - headers, rate
//! limit, transport certificate, PKCE, pushed authorization request and
//! proof of possession, in that order, cheapest first, one audit event per
//! outcome. Admitted commands then run through [`flows`], where the
//! [`idempotency::IdempotencyCoordinator`] guarantees at-most-once
//! execution per (participant, key) and byte-identical replay for
//! duplicates. State lives in three aggregates: [`consent::Consent`]
//! (Pending to Authorized to Revoked, expiry derived at read time),
//! [`bulk::BulkFile`] (acceptance decided at intake, settlement confirmed
//! by polling), and the committed idempotency records themselves.
//!
//! Stores are traits with in-memory reference implementations; deployments
//! back them with a shared cache and a database. Every security consumer
//! fails closed when its store is unreachable.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fapigate_core::{MemoryAuditSink, MemoryTtlStore, ParticipantId};
//! use fapigate_engine::config::GatewayConfigBuilder;
//! use fapigate_engine::gate::{Authorization, GateRequest, GatewayOperation, SecurityGate};
//! use fapigate_engine::mtls::MemoryCertificateDirectory;
//! use fapigate_engine::pkce::MemoryPushedRequestRegistry;
//!
//! # async fn example() -> fapigate_core::Result<()> {
//! let gate = SecurityGate::new(
//!     GatewayConfigBuilder::new().require_certificate(false).build(),
//!     Arc::new(MemoryTtlStore::new()),
//!     Arc::new(MemoryCertificateDirectory::new()),
//!     Arc::new(MemoryPushedRequestRegistry::new()),
//!     Arc::new(MemoryAuditSink::new()),
//! );
//!
//! let request = GateRequest::new(
//!     GatewayOperation::PaymentSubmit,
//!     "POST",
//!     "https://api.bank.example/payments",
//!     ParticipantId::new("tpp-001")?,
//! )
//! .interaction_id("7a63e9c0-5b2f-4c11-9e5d-0d4f2b7a9c31")
//! .idempotency_key("payment-2024-0001")
//! .authorization(Authorization::Dpop { token: "token".into() })
//! .proof("<compact-dpop-jwt>");
//!
//! let admission = gate.validate(&request).await?;
//! println!("admitted {}", admission.interaction_id);
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use
)]

pub mod bulk;
pub mod config;
pub mod consent;
pub mod events;
pub mod flows;
pub mod gate;
pub mod idempotency;
pub mod mtls;
pub mod pkce;
pub mod ratelimit;

pub use bulk::{
    AdvanceOutcome, BulkFile, BulkFileReport, BulkFileStatus, BulkFileStore, BulkItemSubmission,
    BulkSubmission, IntegrityMode, MemoryBulkFileStore,
};
pub use config::{GatewayConfig, GatewayConfigBuilder};
pub use consent::{
    Consent, ConsentError, ConsentEvent, ConsentStatus, ConsentStore, CorporateConsentContext,
    CorporateTier, MemoryConsentStore,
};
pub use events::{BulkFileEvent, ChannelEventSink, DomainEvent, EventSink, MemoryEventSink, PaymentEvent};
pub use flows::{BulkReceipt, ConsentFlow, PaymentFlow, PaymentReceipt, PaymentSubmission};
pub use gate::{Admission, Authorization, GateRequest, GatewayOperation, SecurityGate};
pub use idempotency::{
    IdempotencyCoordinator, IdempotencyStore, MemoryIdempotencyStore, Resolution, StoredResponse,
};
pub use mtls::{
    CertificateDirectory, CertificateStatus, CertificateVerifier, ClientCertificate,
    MemoryCertificateDirectory,
};
pub use pkce::{MemoryPushedRequestRegistry, PkceChallenge, PushedRequest, PushedRequestRegistry};
pub use ratelimit::RateLimiter;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
