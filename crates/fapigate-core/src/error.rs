//! Gateway error taxonomy with stable machine-readable codes.
//!
//! Every rejection the gateway surfaces carries a stable `error_code` and an
//! HTTP status, and never leaks internal store or stack detail to callers.
//! The taxonomy follows the failure classes of the trust boundary: caller
//! mistakes, security violations, aggregate/idempotency conflicts, dependency
//! outages (which fail closed for security checks), and missing resources.

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// HTTP-facing classification of a security rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityKind {
    /// Credential or proof could not be authenticated (401)
    Unauthorized,
    /// Caller is authenticated but the request is forbidden (403)
    Forbidden,
    /// Caller exceeded the configured request budget (429)
    RateLimited,
}

impl SecurityKind {
    /// HTTP status code for this class of rejection
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::RateLimited => 429,
        }
    }
}

/// Gateway error taxonomy
///
/// Construction goes through the helper constructors so every variant carries
/// a stable machine-readable code alongside its human-readable message.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Malformed input - the caller's fault, never retried
    #[error("validation failed ({code}): {message}")]
    Validation {
        /// Stable machine-readable error code
        code: &'static str,
        /// Human-readable detail
        message: String,
    },

    /// Security violation - signature, binding, replay or rate-limit failure
    #[error("security violation ({code}): {message}")]
    Security {
        /// HTTP-facing classification (401/403/429)
        kind: SecurityKind,
        /// Stable machine-readable error code
        code: &'static str,
        /// Human-readable detail
        message: String,
    },

    /// Illegal aggregate transition or idempotency conflict
    #[error("state conflict ({code}): {message}")]
    StateConflict {
        /// Stable machine-readable error code
        code: &'static str,
        /// Human-readable detail
        message: String,
    },

    /// A backing store or collaborator is unreachable
    ///
    /// Security checks fail closed on this variant - it is never converted
    /// into an admit decision.
    #[error("dependency unavailable: {reason}")]
    DependencyUnavailable {
        /// Internal reason, logged but not exposed in responses
        reason: String,
    },

    /// Referenced resource does not exist
    #[error("not found: {resource}")]
    NotFound {
        /// Resource description
        resource: String,
    },
}

impl GatewayError {
    /// Create a validation error
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Create an unauthorized security violation (401)
    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        Self::Security {
            kind: SecurityKind::Unauthorized,
            code,
            message: message.into(),
        }
    }

    /// Create a forbidden security violation (403)
    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::Security {
            kind: SecurityKind::Forbidden,
            code,
            message: message.into(),
        }
    }

    /// Create a rate-limited security violation (429)
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::Security {
            kind: SecurityKind::RateLimited,
            code: "rate_limited",
            message: message.into(),
        }
    }

    /// Create a state-conflict error
    pub fn state_conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::StateConflict {
            code,
            message: message.into(),
        }
    }

    /// Create a dependency-unavailable error
    pub fn dependency_unavailable(reason: impl Into<String>) -> Self {
        Self::DependencyUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Stable machine-readable error code for response bodies
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. }
            | Self::Security { code, .. }
            | Self::StateConflict { code, .. } => code,
            Self::DependencyUnavailable { .. } => "dependency_unavailable",
            Self::NotFound { .. } => "not_found",
        }
    }

    /// HTTP status code this error maps to
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Security { kind, .. } => kind.http_status(),
            Self::StateConflict { .. } => 409,
            Self::DependencyUnavailable { .. } => 503,
            Self::NotFound { .. } => 404,
        }
    }

    /// Check if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Security { .. })
    }

    /// Response body for this rejection
    ///
    /// Stable across retries and replays: the same error renders the same
    /// bytes. Dependency failures render a generic message; the internal
    /// reason stays in logs.
    pub fn response_body(&self) -> serde_json::Value {
        let message = match self {
            Self::Validation { message, .. }
            | Self::Security { message, .. }
            | Self::StateConflict { message, .. } => message.clone(),
            Self::DependencyUnavailable { .. } => "service temporarily unavailable".to_string(),
            Self::NotFound { resource } => format!("{resource} not found"),
        };
        serde_json::json!({
            "code": self.error_code(),
            "message": message,
        })
    }

    /// Check if the caller may retry the request unchanged
    ///
    /// Conflicts and validation failures are deterministic; only transient
    /// dependency outages and rate limits warrant a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DependencyUnavailable { .. }
                | Self::Security {
                    kind: SecurityKind::RateLimited,
                    ..
                }
        ) || matches!(
            self,
            Self::StateConflict {
                code: "idempotency_pending",
                ..
            }
        )
    }
}
