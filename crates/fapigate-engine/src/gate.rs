//! The security gate every request crosses before touching an aggregate.
//!
//! Checks run cheapest-first and short-circuit on the first failure:
//! headers, rate limit, transport certificate, PKCE, pushed authorization
//! request, proof of possession. A rate-limited request never reaches proof
//! validation, so its jti stays unburned. Every pass records exactly one
//! audit event, admit or reject; audit delivery is best-effort and never
//! changes the decision. The whole pass runs under a hard timeout that maps
//! to `DependencyUnavailable`, so a stalled store fails closed.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use fapigate_core::audit::{AuditEvent, AuditSink};
use fapigate_core::store::TtlStore;
use fapigate_core::{GatewayError, IdempotencyKey, InteractionId, ParticipantId};
use fapigate_dpop::{ProofValidator, ProofVerification};

use crate::config::GatewayConfig;
use crate::mtls::{CertificateDirectory, CertificateVerifier, ClientCertificate};
use crate::pkce::{PkceChallenge, PushedRequestRegistry};
use crate::ratelimit::RateLimiter;

/// Operations the gateway exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOperation {
    /// Create a consent in Pending
    ConsentCreate,
    /// Customer authorizes a pending consent
    ConsentAuthorize,
    /// Withdraw a consent
    ConsentRevoke,
    /// Extend an authorized consent
    ConsentRenew,
    /// Read a consent
    ConsentGet,
    /// Read account data under a consent
    AccountAccess,
    /// Submit a single payment
    PaymentSubmit,
    /// Upload a bulk payment file
    BulkSubmit,
    /// Read a bulk file report
    BulkReport,
}

impl GatewayOperation {
    /// Whether the operation mutates state and therefore needs an idempotency key
    pub const fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::ConsentCreate
                | Self::ConsentAuthorize
                | Self::ConsentRevoke
                | Self::ConsentRenew
                | Self::PaymentSubmit
                | Self::BulkSubmit
        )
    }

    /// Stable name used in rate limit keys and audit records
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConsentCreate => "consent_create",
            Self::ConsentAuthorize => "consent_authorize",
            Self::ConsentRevoke => "consent_revoke",
            Self::ConsentRenew => "consent_renew",
            Self::ConsentGet => "consent_get",
            Self::AccountAccess => "account_access",
            Self::PaymentSubmit => "payment_submit",
            Self::BulkSubmit => "bulk_submit",
            Self::BulkReport => "bulk_report",
        }
    }
}

impl std::fmt::Display for GatewayOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed Authorization header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// `DPoP <token>`; the proof travels in its own header
    Dpop {
        /// The sender-constrained access token
        token: String,
    },
    /// `Bearer <token>`, admitted only under bearer fallback policy
    Bearer {
        /// The bearer access token
        token: String,
    },
}

impl Authorization {
    /// Parse an Authorization header value
    pub fn parse(header: &str) -> Result<Self, GatewayError> {
        let mut parts = header.trim().splitn(2, char::is_whitespace);
        let scheme = parts.next().unwrap_or_default();
        let token = parts.next().map(str::trim).unwrap_or_default().to_string();
        if token.is_empty() {
            return Err(GatewayError::validation(
                "invalid_authorization",
                "authorization header carries no token",
            ));
        }
        if scheme.eq_ignore_ascii_case("dpop") {
            Ok(Self::Dpop { token })
        } else if scheme.eq_ignore_ascii_case("bearer") {
            Ok(Self::Bearer { token })
        } else {
            Err(GatewayError::unauthorized(
                "unsupported_auth_scheme",
                format!("authorization scheme '{scheme}' is not accepted"),
            ))
        }
    }

    /// The access token regardless of scheme
    pub fn token(&self) -> &str {
        match self {
            Self::Dpop { token } | Self::Bearer { token } => token,
        }
    }
}

/// Everything the gate needs to decide one request
///
/// Hosts build one of these from the transport layer: headers land as raw
/// strings so malformed values are rejected here, with a stable code, rather
/// than upstream.
#[derive(Debug, Clone)]
pub struct GateRequest {
    /// Operation the request targets
    pub operation: GatewayOperation,
    /// HTTP method of the actual request
    pub method: String,
    /// Full URL of the actual request
    pub url: String,
    /// Participant resolved from transport identity
    pub participant: ParticipantId,
    /// Parsed Authorization header, absent when the header was missing
    pub authorization: Option<Authorization>,
    /// Compact proof from the DPoP header
    pub proof: Option<String>,
    /// Raw interaction id header
    pub interaction_id: Option<String>,
    /// Raw customer auth date header
    pub auth_date: Option<String>,
    /// Raw customer IP header
    pub customer_ip: Option<String>,
    /// Raw idempotency key header
    pub idempotency_key: Option<String>,
    /// Client certificate forwarded by the TLS terminator
    pub certificate: Option<ClientCertificate>,
    /// PKCE method and challenge request parameters
    pub pkce: Option<(String, String)>,
    /// Pushed authorization request reference
    pub par_request_uri: Option<String>,
    /// Thumbprint the access token is bound to (`cnf`/`jkt`)
    pub bound_thumbprint: Option<String>,
}

impl GateRequest {
    /// Start a request for an operation
    pub fn new(
        operation: GatewayOperation,
        method: impl Into<String>,
        url: impl Into<String>,
        participant: ParticipantId,
    ) -> Self {
        Self {
            operation,
            method: method.into(),
            url: url.into(),
            participant,
            authorization: None,
            proof: None,
            interaction_id: None,
            auth_date: None,
            customer_ip: None,
            idempotency_key: None,
            certificate: None,
            pkce: None,
            par_request_uri: None,
            bound_thumbprint: None,
        }
    }

    /// Attach the parsed Authorization header
    #[must_use]
    pub fn authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = Some(authorization);
        self
    }

    /// Attach the compact proof from the DPoP header
    #[must_use]
    pub fn proof(mut self, compact: impl Into<String>) -> Self {
        self.proof = Some(compact.into());
        self
    }

    /// Attach the raw interaction id header
    #[must_use]
    pub fn interaction_id(mut self, raw: impl Into<String>) -> Self {
        self.interaction_id = Some(raw.into());
        self
    }

    /// Attach the raw customer auth date header
    #[must_use]
    pub fn auth_date(mut self, raw: impl Into<String>) -> Self {
        self.auth_date = Some(raw.into());
        self
    }

    /// Attach the raw customer IP header
    #[must_use]
    pub fn customer_ip(mut self, raw: impl Into<String>) -> Self {
        self.customer_ip = Some(raw.into());
        self
    }

    /// Attach the raw idempotency key header
    #[must_use]
    pub fn idempotency_key(mut self, raw: impl Into<String>) -> Self {
        self.idempotency_key = Some(raw.into());
        self
    }

    /// Attach the forwarded client certificate
    #[must_use]
    pub fn certificate(mut self, certificate: ClientCertificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    /// Attach PKCE request parameters
    #[must_use]
    pub fn pkce(mut self, method: impl Into<String>, challenge: impl Into<String>) -> Self {
        self.pkce = Some((method.into(), challenge.into()));
        self
    }

    /// Attach a pushed authorization request reference
    #[must_use]
    pub fn par_request_uri(mut self, uri: impl Into<String>) -> Self {
        self.par_request_uri = Some(uri.into());
        self
    }

    /// Attach the thumbprint the access token is bound to
    #[must_use]
    pub fn bound_thumbprint(mut self, thumbprint: impl Into<String>) -> Self {
        self.bound_thumbprint = Some(thumbprint.into());
        self
    }
}

/// Proof that a request crossed the gate
#[derive(Debug, Clone)]
pub struct Admission {
    /// Parsed interaction id, echoed on the response
    pub interaction_id: InteractionId,
    /// Admitted participant
    pub participant: ParticipantId,
    /// Operation the request was admitted for
    pub operation: GatewayOperation,
    /// Parsed idempotency key, present on mutating operations
    pub idempotency_key: Option<IdempotencyKey>,
    /// Proof verification, absent only under bearer fallback
    pub proof: Option<ProofVerification>,
    /// When the gate admitted the request
    pub admitted_at: DateTime<Utc>,
}

/// The trust boundary in front of every gateway operation
#[derive(Debug)]
pub struct SecurityGate {
    config: GatewayConfig,
    rate_limiter: RateLimiter,
    certificates: CertificateVerifier,
    pushed_requests: Arc<dyn PushedRequestRegistry>,
    proof_validator: ProofValidator,
    audit: Arc<dyn AuditSink>,
}

impl SecurityGate {
    /// Assemble a gate from its collaborators
    ///
    /// The TTL store backs both the rate limiter and proof replay detection,
    /// the way a shared cache does in deployment.
    pub fn new(
        config: GatewayConfig,
        ttl_store: Arc<dyn TtlStore>,
        directory: Arc<dyn CertificateDirectory>,
        pushed_requests: Arc<dyn PushedRequestRegistry>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit.clone(), Arc::clone(&ttl_store));
        let certificates = CertificateVerifier::new(config.mtls.clone(), directory);
        let proof_validator = ProofValidator::new(config.proof.clone(), ttl_store);
        Self {
            config,
            rate_limiter,
            certificates,
            pushed_requests,
            proof_validator,
            audit,
        }
    }

    /// Decide one request
    pub async fn validate(&self, request: &GateRequest) -> Result<Admission, GatewayError> {
        let result = match tokio::time::timeout(self.config.gate_timeout, self.run_checks(request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::dependency_unavailable(
                "security gate timed out",
            )),
        };
        self.audit_outcome(request, &result).await;
        result
    }

    async fn run_checks(&self, request: &GateRequest) -> Result<Admission, GatewayError> {
        let interaction_id = self.check_headers(request)?;
        let idempotency_key = self.check_idempotency_key(request)?;

        let decision = self
            .rate_limiter
            .check(&request.participant, request.operation.as_str())
            .await?;
        if !decision.admitted {
            return Err(GatewayError::rate_limited(format!(
                "{} calls in the current window, limit {}",
                decision.count, decision.limit
            )));
        }

        self.certificates.check(request.certificate.as_ref()).await?;

        let challenge = self.check_pkce(request)?;
        self.check_pushed_request(request, challenge.as_ref()).await?;
        let proof = self.check_proof(request).await?;

        Ok(Admission {
            interaction_id,
            participant: request.participant.clone(),
            operation: request.operation,
            idempotency_key,
            proof,
            admitted_at: Utc::now(),
        })
    }

    fn check_headers(&self, request: &GateRequest) -> Result<InteractionId, GatewayError> {
        let raw = request.interaction_id.as_deref().ok_or_else(|| {
            GatewayError::validation(
                "missing_interaction_id",
                "interaction id header is required",
            )
        })?;
        let interaction_id = InteractionId::parse(raw)?;

        if let Some(raw) = request.auth_date.as_deref() {
            let auth_date = parse_auth_date(raw)?;
            let skew = ChronoDuration::from_std(self.config.auth.auth_date_skew)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
            if (Utc::now() - auth_date).abs() > skew {
                return Err(GatewayError::validation(
                    "stale_auth_date",
                    "customer auth date is outside the tolerated window",
                ));
            }
        }

        if let Some(raw) = request.customer_ip.as_deref() {
            raw.trim().parse::<IpAddr>().map_err(|_| {
                GatewayError::validation(
                    "invalid_customer_ip",
                    "customer IP header is not an IP address",
                )
            })?;
        }

        Ok(interaction_id)
    }

    fn check_idempotency_key(
        &self,
        request: &GateRequest,
    ) -> Result<Option<IdempotencyKey>, GatewayError> {
        match request.idempotency_key.as_deref() {
            Some(raw) => Ok(Some(IdempotencyKey::new(raw)?)),
            None if request.operation.is_mutating() => Err(GatewayError::validation(
                "missing_idempotency_key",
                format!(
                    "idempotency key header is required for {}",
                    request.operation
                ),
            )),
            None => Ok(None),
        }
    }

    fn check_pkce(&self, request: &GateRequest) -> Result<Option<PkceChallenge>, GatewayError> {
        match &request.pkce {
            Some((method, challenge)) => Ok(Some(PkceChallenge::parse(method, challenge)?)),
            None if request.operation == GatewayOperation::ConsentAuthorize => {
                Err(GatewayError::validation(
                    "missing_pkce",
                    "consent authorization requires an S256 challenge",
                ))
            }
            None => Ok(None),
        }
    }

    async fn check_pushed_request(
        &self,
        request: &GateRequest,
        challenge: Option<&PkceChallenge>,
    ) -> Result<(), GatewayError> {
        let uri = match request.par_request_uri.as_deref() {
            Some(uri) => uri,
            None => {
                if self.config.auth.require_par
                    && request.operation == GatewayOperation::ConsentAuthorize
                {
                    return Err(GatewayError::unauthorized(
                        "par_required",
                        "consent authorization must present a pushed request_uri",
                    ));
                }
                return Ok(());
            }
        };

        let pushed = self
            .pushed_requests
            .take(uri)
            .await
            .map_err(|e| {
                GatewayError::dependency_unavailable(format!("pushed request registry: {e}"))
            })?
            .ok_or_else(|| {
                GatewayError::unauthorized(
                    "par_unknown",
                    "request_uri is unknown or was already presented",
                )
            })?;

        if pushed.is_expired() {
            return Err(GatewayError::unauthorized(
                "par_expired",
                "pushed request lapsed before presentation",
            ));
        }
        if pushed.participant != request.participant {
            tracing::warn!(
                participant = %request.participant,
                pusher = %pushed.participant,
                "request_uri presented by a different participant"
            );
            return Err(GatewayError::forbidden(
                "par_participant_mismatch",
                "request_uri was pushed by a different participant",
            ));
        }
        if let Some(challenge) = challenge {
            if pushed.challenge != *challenge {
                return Err(GatewayError::validation(
                    "pkce_challenge_mismatch",
                    "challenge differs from the one pinned at push time",
                ));
            }
        }
        Ok(())
    }

    async fn check_proof(
        &self,
        request: &GateRequest,
    ) -> Result<Option<ProofVerification>, GatewayError> {
        match &request.authorization {
            None => Err(GatewayError::unauthorized(
                "missing_authorization",
                "request carries no authorization",
            )),
            Some(Authorization::Dpop { token }) => {
                let compact = request.proof.as_deref().ok_or_else(|| {
                    GatewayError::unauthorized(
                        "missing_proof",
                        "DPoP scheme requires a proof header",
                    )
                })?;
                let verification = self
                    .proof_validator
                    .validate(
                        compact,
                        &request.method,
                        &request.url,
                        Some(token),
                        request.bound_thumbprint.as_deref(),
                    )
                    .await?;
                Ok(Some(verification))
            }
            Some(Authorization::Bearer { .. }) => {
                if !self.config.auth.allow_bearer_fallback {
                    return Err(GatewayError::unauthorized(
                        "bearer_not_allowed",
                        "bearer tokens are not accepted on this surface",
                    ));
                }
                tracing::debug!(participant = %request.participant, "bearer fallback admitted");
                Ok(None)
            }
        }
    }

    async fn audit_outcome(
        &self,
        request: &GateRequest,
        result: &Result<Admission, GatewayError>,
    ) {
        let now = Utc::now();
        let raw_interaction = request.interaction_id.clone().unwrap_or_default();
        let event = match result {
            Ok(_) => AuditEvent::admitted(
                raw_interaction,
                request.participant.to_string(),
                request.operation.as_str(),
                now,
            ),
            Err(e) => AuditEvent::rejected(
                raw_interaction,
                Some(request.participant.to_string()),
                request.operation.as_str(),
                e.error_code(),
                now,
            ),
        };
        if let Err(e) = self.audit.record(event).await {
            tracing::warn!(error = %e, "audit sink rejected gate event");
        }
    }
}

/// Parse a customer auth date header
///
/// HTTP-date per the FAPI header convention, with RFC 3339 accepted for
/// clients that send machine timestamps.
fn parse_auth_date(raw: &str) -> Result<DateTime<Utc>, GatewayError> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            GatewayError::validation(
                "invalid_auth_date",
                "auth date is neither an HTTP-date nor RFC 3339",
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_parsing() {
        assert_eq!(
            Authorization::parse("DPoP token-123").unwrap(),
            Authorization::Dpop {
                token: "token-123".into()
            }
        );
        assert_eq!(
            Authorization::parse("bearer tok").unwrap(),
            Authorization::Bearer { token: "tok".into() }
        );

        assert_eq!(
            Authorization::parse("Basic dXNlcjpwYXNz").unwrap_err().error_code(),
            "unsupported_auth_scheme"
        );
        assert_eq!(
            Authorization::parse("DPoP   ").unwrap_err().error_code(),
            "invalid_authorization"
        );
    }

    #[test]
    fn test_mutating_operations_are_the_command_set() {
        assert!(GatewayOperation::PaymentSubmit.is_mutating());
        assert!(GatewayOperation::BulkSubmit.is_mutating());
        assert!(GatewayOperation::ConsentRevoke.is_mutating());
        assert!(!GatewayOperation::ConsentGet.is_mutating());
        assert!(!GatewayOperation::AccountAccess.is_mutating());
        assert!(!GatewayOperation::BulkReport.is_mutating());
    }

    #[test]
    fn test_auth_date_formats() {
        assert!(parse_auth_date("Tue, 11 Sep 2012 19:43:31 GMT").is_ok());
        assert!(parse_auth_date("2024-03-01T10:00:00Z").is_ok());
        assert_eq!(
            parse_auth_date("yesterday").unwrap_err().error_code(),
            "invalid_auth_date"
        );
    }
}
