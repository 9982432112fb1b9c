//! # fapigate Core
//!
//! Foundation crate for the fapigate Open Finance gateway providing the value
//! types, error taxonomy, and shared-store abstractions the security gate and
//! command engine are built on.
//!
//! ## Features
//!
//! - **Validated value types** - Participant/consent/file identifiers, amounts
//!   and IBANs constructed through validating factories; invalid states are
//!   unrepresentable after construction
//! - **Gateway error taxonomy** - Stable machine-readable error codes with
//!   HTTP status mapping; internal store failures never leak to callers
//! - **Atomic TTL store** - Check-and-set and increment-with-TTL primitives
//!   backing replay protection, rate limiting and idempotency claims
//! - **Canonical request hashing** - Key-order and whitespace independent
//!   request digests for idempotent replay detection
//! - **Audit events** - Best-effort audit sink contract for security decisions
//!
//! ## Architecture
//!
//! ```text
//! fapigate-core/
//! ├── error/          # GatewayError taxonomy and HTTP mapping
//! ├── types/          # Identifier and value newtypes
//! ├── scope/          # Normalized scope sets
//! ├── hash/           # Canonical request hashing
//! ├── store/          # Atomic TTL store trait + memory implementation
//! └── audit/          # Audit events and sinks
//! ```
//!
//! This crate is typically not used directly but imported by `fapigate-dpop`
//! and `fapigate-engine`.

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

pub mod audit;
pub mod error;
pub mod hash;
pub mod scope;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use audit::{AuditEvent, AuditOutcome, AuditSink, ChannelAuditSink, MemoryAuditSink};
pub use error::{GatewayError, Result, SecurityKind};
pub use hash::{canonical_json, RequestHash};
pub use scope::ScopeSet;
pub use store::{MemoryTtlStore, SetOutcome, StoreError, TtlStore};
pub use types::{
    AccountId, Amount, ConsentId, CustomerId, FileId, Iban, IdempotencyKey, InteractionId,
    OperationId, ParticipantId,
};

/// Maximum accepted idempotency key length (Open Banking header convention)
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 40;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_length_constant() {
        // The Open Banking idempotency header caps keys at 40 characters
        assert_eq!(MAX_IDEMPOTENCY_KEY_LEN, 40);
    }
}
