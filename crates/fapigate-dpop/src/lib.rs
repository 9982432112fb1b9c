//! # fapigate DPoP
//!
//! RFC 9449 proof-of-possession for the fapigate Open Finance gateway.
//!
//! Every call that crosses the trust boundary carries a DPoP proof: a short
//! lived JWT, signed with the participant's key, binding the request method
//! and URL (and the access token, when one is presented) to that key. This
//! crate implements both halves:
//!
//! - **Validation** - structural parsing, single-use `jti` enforcement
//!   through a shared TTL store, method/URL/token binding, freshness with
//!   bounded clock skew, server nonce policy, and signature verification
//!   for ES256, RS256 and PS256
//! - **Signing** - key generation with zeroized private material and compact
//!   proof construction, used by client tooling and the integration tests
//!
//! The `jti` of every presented proof is burned before any other check runs,
//! so a proof rejected for one reason can never be replayed for another.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fapigate_core::MemoryTtlStore;
//! use fapigate_dpop::{
//!     DpopAlgorithm, KeyPair, ProofRequest, ProofSigner, ProofValidator,
//!     ProofValidatorConfig,
//! };
//!
//! # async fn example() -> fapigate_dpop::Result<()> {
//! // Participant side: sign a proof over the request
//! let signer = ProofSigner::new(KeyPair::generate(DpopAlgorithm::ES256)?);
//! let proof = signer.sign(&ProofRequest::new(
//!     "POST",
//!     "https://api.bank.example/payments",
//! ))?;
//!
//! // Gateway side: validate against the request and the shared replay store
//! let validator = ProofValidator::new(
//!     ProofValidatorConfig::default(),
//!     Arc::new(MemoryTtlStore::new()),
//! );
//! let verification = validator
//!     .validate(&proof, "POST", "https://api.bank.example/payments", None, None)
//!     .await?;
//! println!("bound key: {}", verification.thumbprint);
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

pub mod errors;
pub mod keys;
pub mod nonce;
pub mod sign;
pub mod types;
pub mod validate;

pub use errors::{DpopError, ErrorSeverity};
pub use keys::{KeyPair, PrivateKeyMaterial};
pub use nonce::NonceIssuer;
pub use sign::{ProofRequest, ProofSigner};
pub use types::{
    access_token_hash, normalize_htu, DpopAlgorithm, DpopProof, Jwk, ProofHeader, ProofPayload,
    ProofVerification,
};
pub use validate::{ProofValidator, ProofValidatorConfig};

/// DPoP result type
pub type Result<T> = std::result::Result<T, DpopError>;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// JWT `typ` header value proofs must carry, per RFC 9449
pub const DPOP_JWT_TYPE: &str = "dpop+jwt";

/// Default tolerated clock skew on `iat` (seconds)
pub const DEFAULT_IAT_SKEW_SECONDS: u64 = 60;

/// Default proof lifetime after `iat` (seconds)
pub const DEFAULT_PROOF_LIFETIME_SECONDS: u64 = 300;
