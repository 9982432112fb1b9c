//! Compact proof construction, the participant side of possession.
//!
//! The resource-server half of this crate only validates; signing lives here
//! so integration tests and client tooling can produce real proofs against
//! the same types the validator consumes.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::rngs::OsRng;
use sha2::Sha256;
use signature::{RandomizedSigner, SignatureEncoding, Signer};
use uuid::Uuid;

use crate::errors::DpopError;
use crate::keys::{KeyPair, PrivateKeyMaterial};
use crate::types::{access_token_hash, normalize_htu, DpopAlgorithm, ProofHeader, ProofPayload};
use crate::DPOP_JWT_TYPE;

/// The request a proof should bind to, plus optional claims
///
/// `jti` and `issued_at` default to a fresh UUID and the current clock;
/// overriding them exists for exercising replay and freshness handling.
#[derive(Debug, Clone)]
pub struct ProofRequest<'a> {
    method: &'a str,
    url: &'a str,
    access_token: Option<&'a str>,
    nonce: Option<&'a str>,
    jti: Option<String>,
    issued_at: Option<i64>,
}

impl<'a> ProofRequest<'a> {
    /// Bind a proof to an HTTP method and target URL
    pub fn new(method: &'a str, url: &'a str) -> Self {
        Self {
            method,
            url,
            access_token: None,
            nonce: None,
            jti: None,
            issued_at: None,
        }
    }

    /// Hash this access token into the `ath` claim
    pub fn access_token(mut self, token: &'a str) -> Self {
        self.access_token = Some(token);
        self
    }

    /// Echo a server-issued nonce
    pub fn nonce(mut self, nonce: &'a str) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Use a specific proof id instead of a fresh UUID
    pub fn jti(mut self, jti: impl Into<String>) -> Self {
        self.jti = Some(jti.into());
        self
    }

    /// Use a specific issue time instead of the current clock
    pub fn issued_at(mut self, iat: i64) -> Self {
        self.issued_at = Some(iat);
        self
    }
}

/// Signs compact proofs with a single key pair
#[derive(Debug)]
pub struct ProofSigner {
    key_pair: KeyPair,
}

impl ProofSigner {
    /// Wrap a key pair for proof signing
    pub fn new(key_pair: KeyPair) -> Self {
        Self { key_pair }
    }

    /// The key pair backing this signer
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// Produce a compact serialized proof for the given request
    pub fn sign(&self, request: &ProofRequest<'_>) -> Result<String, DpopError> {
        let payload = ProofPayload {
            jti: request
                .jti
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            htm: request.method.to_ascii_uppercase(),
            htu: normalize_htu(request.url)?,
            iat: request.issued_at.unwrap_or_else(|| Utc::now().timestamp()),
            ath: request.access_token.map(access_token_hash),
            nonce: request.nonce.map(str::to_string),
        };
        let header = ProofHeader {
            typ: DPOP_JWT_TYPE.to_string(),
            alg: self.key_pair.algorithm().as_str().to_string(),
            jwk: self.key_pair.public_jwk().clone(),
        };

        let header_json = serde_json::to_string(&header)
            .map_err(|e| signing_failed(format!("header serialization failed: {e}")))?;
        let payload_json = serde_json::to_string(&payload)
            .map_err(|e| signing_failed(format!("payload serialization failed: {e}")))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(payload_json)
        );
        let signature = self.sign_bytes(&signing_input)?;
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    fn sign_bytes(&self, input: &str) -> Result<Vec<u8>, DpopError> {
        match (self.key_pair.algorithm(), self.key_pair.private_key()) {
            (DpopAlgorithm::ES256, PrivateKeyMaterial::EcP256 { key_bytes }) => {
                let signing_key = p256::ecdsa::SigningKey::from_bytes(key_bytes.into())
                    .map_err(|e| signing_failed(format!("P-256 key rejected: {e}")))?;
                // Fixed-size r || s, 64 bytes, per RFC 7518
                let signature: p256::ecdsa::Signature = signing_key.sign(input.as_bytes());
                Ok(signature.to_bytes().to_vec())
            }
            (DpopAlgorithm::RS256, PrivateKeyMaterial::Rsa { key_der }) => {
                let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(rsa_private(key_der)?);
                let signature = signing_key
                    .try_sign(input.as_bytes())
                    .map_err(|e| signing_failed(format!("RSA signing failed: {e}")))?;
                Ok(signature.to_bytes().to_vec())
            }
            (DpopAlgorithm::PS256, PrivateKeyMaterial::Rsa { key_der }) => {
                let signing_key =
                    rsa::pss::BlindedSigningKey::<Sha256>::new(rsa_private(key_der)?);
                let signature = signing_key.sign_with_rng(&mut OsRng, input.as_bytes());
                Ok(signature.to_bytes().to_vec())
            }
            _ => Err(signing_failed(
                "key material does not match the declared algorithm",
            )),
        }
    }
}

fn rsa_private(key_der: &[u8]) -> Result<rsa::RsaPrivateKey, DpopError> {
    use rsa::pkcs8::DecodePrivateKey;
    rsa::RsaPrivateKey::from_pkcs8_der(key_der)
        .map_err(|e| signing_failed(format!("RSA key rejected: {e}")))
}

fn signing_failed(reason: impl Into<String>) -> DpopError {
    DpopError::SigningFailed {
        reason: reason.into(),
    }
}
