//! Typed proof rejections with security classification.
//!
//! Every way a proof can fail maps to exactly one variant here, and every
//! variant maps to a stable error code the gateway surfaces unchanged.
//! Severity drives alerting: a replayed jti is an attack signal, an expired
//! proof is usually a slow client clock.

use std::fmt;

use thiserror::Error;

use fapigate_core::GatewayError;

/// Proof validation and signing failures
#[derive(Debug, Clone, Error)]
pub enum DpopError {
    /// The compact proof could not be parsed into a well-formed DPoP JWT
    #[error("malformed proof: {reason}")]
    MalformedProof {
        /// What failed to parse
        reason: String,
    },

    /// The `alg` header is not on the asymmetric allow-list
    ///
    /// Symmetric algorithms are rejected here even when a verification path
    /// exists for them; an HMAC proof proves possession of nothing.
    #[error("unsupported proof algorithm: {alg}")]
    UnsupportedAlgorithm {
        /// The rejected algorithm name
        alg: String,
    },

    /// The proof does not bind to this request, token or key
    #[error("proof binding mismatch: {reason}")]
    BindingMismatch {
        /// Which binding failed (htm, htu, ath, jkt, nonce)
        reason: String,
    },

    /// The proof timestamp is outside the accepted window
    #[error("proof expired: issued at {issued_at}, {reason}")]
    Expired {
        /// `iat` claim (Unix seconds)
        issued_at: i64,
        /// Skew or lifetime bound that was exceeded
        reason: String,
    },

    /// The jti has been seen before within the replay window
    #[error("proof replayed: jti '{jti}' already used")]
    Replayed {
        /// The replayed proof identifier
        jti: String,
    },

    /// The signature does not verify against the embedded public key
    #[error("proof signature invalid: {reason}")]
    SignatureInvalid {
        /// Verification failure detail
        reason: String,
    },

    /// Key generation or proof signing failed (client side)
    #[error("proof signing failed: {reason}")]
    SigningFailed {
        /// Crypto backend detail
        reason: String,
    },

    /// The replay store could not be reached
    ///
    /// Always a rejection for the caller - an unreachable replay store never
    /// defaults to allow.
    #[error("replay store unavailable: {reason}")]
    StoreUnavailable {
        /// Backend detail, logged but not exposed
        reason: String,
    },
}

impl DpopError {
    /// Stable machine-readable code for this rejection
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedProof { .. } => "proof_malformed",
            Self::UnsupportedAlgorithm { .. } => "proof_algorithm_rejected",
            Self::BindingMismatch { .. } => "proof_binding_mismatch",
            Self::Expired { .. } => "proof_expired",
            Self::Replayed { .. } => "proof_replayed",
            Self::SignatureInvalid { .. } => "proof_signature_invalid",
            Self::SigningFailed { .. } => "proof_signing_failed",
            Self::StoreUnavailable { .. } => "dependency_unavailable",
        }
    }

    /// Check if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Replayed { .. }
                | Self::BindingMismatch { .. }
                | Self::SignatureInvalid { .. }
                | Self::UnsupportedAlgorithm { .. }
        )
    }

    /// Check if this error is due to client clock skew
    pub fn is_clock_skew_error(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }

    /// Severity for logging and alerting
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            // Active attack signals
            Self::Replayed { .. } | Self::SignatureInvalid { .. } => ErrorSeverity::Critical,

            // Wrong key, wrong request, or a downgrade attempt
            Self::BindingMismatch { .. } | Self::UnsupportedAlgorithm { .. } => {
                ErrorSeverity::High
            }

            // Usually client-side clock or implementation mistakes
            Self::Expired { .. } | Self::MalformedProof { .. } => ErrorSeverity::Medium,

            // Operational
            Self::SigningFailed { .. } | Self::StoreUnavailable { .. } => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Operational issues that do not affect security
    Low,
    /// Client errors or misconfigurations
    Medium,
    /// Likely misuse requiring investigation
    High,
    /// Security violations requiring immediate attention
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<DpopError> for GatewayError {
    fn from(err: DpopError) -> Self {
        match &err {
            DpopError::StoreUnavailable { reason } => {
                GatewayError::dependency_unavailable(format!("replay store: {reason}"))
            }
            DpopError::SigningFailed { reason } => {
                GatewayError::dependency_unavailable(format!("proof signing: {reason}"))
            }
            _ => GatewayError::unauthorized(err.error_code(), err.to_string()),
        }
    }
}
