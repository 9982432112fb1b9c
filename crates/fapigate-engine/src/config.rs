//! Gateway configuration management

use std::time::Duration;

use serde::{Deserialize, Serialize};

use fapigate_dpop::ProofValidatorConfig;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Per-participant rate limiting
    pub rate_limit: RateLimitConfig,
    /// Transport certificate policy
    pub mtls: MtlsConfig,
    /// Authorization header and flow policy
    pub auth: AuthPolicy,
    /// Proof-of-possession validation policy
    pub proof: ProofValidatorConfig,
    /// Idempotent command coordination
    pub idempotency: IdempotencyConfig,
    /// Bulk file intake and settlement
    pub bulk: BulkConfig,
    /// Hard ceiling on a full gate pass, dependency stalls included
    pub gate_timeout: Duration,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Admitted calls per participant and operation within the window
    pub limit: u64,
    /// Length of the counting window
    pub window: Duration,
}

/// Transport certificate policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtlsConfig {
    /// Reject requests that arrive without a client certificate
    pub require_certificate: bool,
    /// SHA-256 fingerprints rejected regardless of directory status
    pub denied_fingerprints: Vec<String>,
}

/// Authorization policy for admitted requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPolicy {
    /// Accept plain bearer tokens where a proof-bound scheme is expected
    ///
    /// Off in production profiles. Exists for participant migration windows.
    pub allow_bearer_fallback: bool,
    /// Require pushed authorization requests on consent authorization
    pub require_par: bool,
    /// Tolerated skew on the customer auth date header
    pub auth_date_skew: Duration,
}

/// Idempotency coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long committed responses stay replayable
    pub record_ttl: Duration,
    /// Lease on an in-flight claim before it can be reclaimed
    pub claim_lease: Duration,
    /// How long a duplicate waits for the first execution to commit
    pub wait_timeout: Duration,
    /// Poll interval while waiting on an in-flight claim
    pub poll_interval: Duration,
}

/// Bulk file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Status polls before a processing file snaps to its settled status
    pub poll_threshold: u32,
    /// Maximum items accepted in a single file
    pub max_items: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            mtls: MtlsConfig::default(),
            auth: AuthPolicy::default(),
            proof: ProofValidatorConfig::default(),
            idempotency: IdempotencyConfig::default(),
            bulk: BulkConfig::default(),
            gate_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 300,
            window: Duration::from_secs(60),
        }
    }
}

impl Default for MtlsConfig {
    fn default() -> Self {
        Self {
            require_certificate: true,
            denied_fingerprints: Vec::new(),
        }
    }
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            allow_bearer_fallback: false,
            require_par: true,
            auth_date_skew: Duration::from_secs(300),
        }
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            // Open Banking convention: replays honored for 24 hours
            record_ttl: Duration::from_secs(24 * 3600),
            claim_lease: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            poll_threshold: 3,
            max_items: 10_000,
        }
    }
}

/// Configuration builder
#[derive(Debug)]
pub struct GatewayConfigBuilder {
    /// Configuration being built
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Create a new configuration builder
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
        }
    }

    /// Set the rate limit and window
    #[must_use]
    pub const fn rate_limit(mut self, limit: u64, window: Duration) -> Self {
        self.config.rate_limit.enabled = true;
        self.config.rate_limit.limit = limit;
        self.config.rate_limit.window = window;
        self
    }

    /// Disable rate limiting
    #[must_use]
    pub const fn no_rate_limit(mut self) -> Self {
        self.config.rate_limit.enabled = false;
        self
    }

    /// Require or waive client certificates
    #[must_use]
    pub const fn require_certificate(mut self, required: bool) -> Self {
        self.config.mtls.require_certificate = required;
        self
    }

    /// Reject a specific certificate fingerprint
    pub fn deny_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.config.mtls.denied_fingerprints.push(fingerprint.into());
        self
    }

    /// Allow plain bearer tokens where a proof is expected
    #[must_use]
    pub const fn allow_bearer_fallback(mut self, allowed: bool) -> Self {
        self.config.auth.allow_bearer_fallback = allowed;
        self
    }

    /// Require pushed authorization requests on consent authorization
    #[must_use]
    pub const fn require_par(mut self, required: bool) -> Self {
        self.config.auth.require_par = required;
        self
    }

    /// Set the proof validation policy
    #[must_use]
    pub fn proof(mut self, proof: ProofValidatorConfig) -> Self {
        self.config.proof = proof;
        self
    }

    /// Set the idempotency coordination policy
    #[must_use]
    pub fn idempotency(mut self, idempotency: IdempotencyConfig) -> Self {
        self.config.idempotency = idempotency;
        self
    }

    /// Set the bulk file policy
    #[must_use]
    pub fn bulk(mut self, bulk: BulkConfig) -> Self {
        self.config.bulk = bulk;
        self
    }

    /// Set the hard gate timeout
    #[must_use]
    pub const fn gate_timeout(mut self, timeout: Duration) -> Self {
        self.config.gate_timeout = timeout;
        self
    }

    /// Build the configuration
    #[must_use]
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

impl Default for GatewayConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
