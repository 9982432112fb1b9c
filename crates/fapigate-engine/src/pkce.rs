//! PKCE challenges and pushed authorization requests.
//!
//! Consent authorization only admits code flows pinned by an S256 challenge;
//! `plain` is rejected outright. Pushed authorization requests (PAR) are
//! single-use: taking one consumes it, so a request_uri cannot be presented
//! twice.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use fapigate_core::store::StoreError;
use fapigate_core::{GatewayError, ParticipantId};

/// Challenge method, S256 only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkceMethod {
    /// base64url SHA-256 of the code verifier
    S256,
}

/// A structurally valid PKCE challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge {
    /// Challenge method
    pub method: PkceMethod,
    /// The 43-character base64url challenge value
    pub challenge: String,
}

impl PkceChallenge {
    /// Parse a method/challenge pair from request parameters
    pub fn parse(method: &str, challenge: &str) -> Result<Self, GatewayError> {
        if method != "S256" {
            return Err(GatewayError::validation(
                "pkce_method_rejected",
                format!("challenge method '{method}' is not S256"),
            ));
        }
        // S256 output is exactly 32 hashed bytes, 43 base64url characters
        if challenge.len() != 43
            || !challenge
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(GatewayError::validation(
                "pkce_challenge_malformed",
                "challenge is not 43 base64url characters",
            ));
        }
        Ok(Self {
            method: PkceMethod::S256,
            challenge: challenge.to_string(),
        })
    }

    /// Whether a code verifier hashes to this challenge
    pub fn matches_verifier(&self, verifier: &str) -> bool {
        if verifier.len() < 43 || verifier.len() > 128 {
            return false;
        }
        if !verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
        {
            return false;
        }
        derive_challenge(verifier) == self.challenge
    }
}

/// Derive the S256 challenge for a code verifier
pub fn derive_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// A pushed authorization request awaiting presentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedRequest {
    /// Single-use reference the participant presents at authorization
    pub request_uri: String,
    /// Participant that pushed the request
    pub participant: ParticipantId,
    /// Challenge pinned at push time
    pub challenge: PkceChallenge,
    /// When the reference stops being presentable
    pub expires_at: DateTime<Utc>,
}

impl PushedRequest {
    /// Mint a pushed request with a fresh RFC 9126 request_uri
    pub fn new(
        participant: ParticipantId,
        challenge: PkceChallenge,
        ttl: std::time::Duration,
    ) -> Self {
        let lifetime = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(90));
        Self {
            request_uri: format!("urn:ietf:params:oauth:request_uri:{}", Uuid::new_v4()),
            participant,
            challenge,
            expires_at: Utc::now() + lifetime,
        }
    }

    /// Whether the reference has lapsed
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Storage for pushed authorization requests
#[async_trait]
pub trait PushedRequestRegistry: Send + Sync + std::fmt::Debug {
    /// Register a pushed request under its request_uri
    async fn register(&self, request: PushedRequest) -> Result<(), StoreError>;

    /// Consume a pushed request; a second take returns `None`
    async fn take(&self, request_uri: &str) -> Result<Option<PushedRequest>, StoreError>;
}

/// In-memory registry for tests and development
#[derive(Debug, Default)]
pub struct MemoryPushedRequestRegistry {
    entries: DashMap<String, PushedRequest>,
}

impl MemoryPushedRequestRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PushedRequestRegistry for MemoryPushedRequestRegistry {
    async fn register(&self, request: PushedRequest) -> Result<(), StoreError> {
        self.entries.insert(request.request_uri.clone(), request);
        Ok(())
    }

    async fn take(&self, request_uri: &str) -> Result<Option<PushedRequest>, StoreError> {
        Ok(self.entries.remove(request_uri).map(|(_, request)| request))
    }
}
