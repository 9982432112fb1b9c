//! Proof validation against a request, a token binding and a replay store.
//!
//! Validation order is deliberate. The jti is marked used before anything
//! else so a proof that fails later checks is burned too: an attacker who
//! captures a rejected proof cannot retry it against a different endpoint.
//! Cheap structural and binding checks then run before the signature, which
//! is the only expensive step.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::Sha256;
use signature::Verifier;

use fapigate_core::store::{SetOutcome, TtlStore};

use crate::errors::DpopError;
use crate::keys::{verifying_key_from_jwk, ProofVerifyingKey};
use crate::nonce::nonce_key;
use crate::types::{access_token_hash, normalize_htu, DpopAlgorithm, DpopProof, ProofVerification};
use crate::{DEFAULT_IAT_SKEW_SECONDS, DEFAULT_PROOF_LIFETIME_SECONDS};

/// Policy knobs for proof validation
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProofValidatorConfig {
    /// Tolerated clock skew on `iat`, both directions
    pub iat_skew: Duration,
    /// How long after `iat` a proof stays acceptable
    pub proof_lifetime: Duration,
    /// Reject proofs that omit `ath` when an access token is presented
    pub require_access_token_hash: bool,
    /// Reject proofs that omit the server-issued nonce
    pub require_server_nonce: bool,
}

impl Default for ProofValidatorConfig {
    fn default() -> Self {
        Self {
            iat_skew: Duration::from_secs(DEFAULT_IAT_SKEW_SECONDS),
            proof_lifetime: Duration::from_secs(DEFAULT_PROOF_LIFETIME_SECONDS),
            require_access_token_hash: true,
            require_server_nonce: false,
        }
    }
}

/// Validates compact proofs for one resource server
///
/// The replay store is shared infrastructure: every gateway instance must
/// point at the same store or single-use `jti` holds only per instance.
#[derive(Debug)]
pub struct ProofValidator {
    config: ProofValidatorConfig,
    replay: Arc<dyn TtlStore>,
}

impl ProofValidator {
    /// Build a validator over a shared replay store
    pub fn new(config: ProofValidatorConfig, replay: Arc<dyn TtlStore>) -> Self {
        Self { config, replay }
    }

    /// The active validation policy
    pub fn config(&self) -> &ProofValidatorConfig {
        &self.config
    }

    /// Validate a compact proof against the request it claims to cover
    ///
    /// `access_token` is the token presented alongside the proof, if any.
    /// `bound_thumbprint` is the `cnf`/`jkt` binding from token introspection;
    /// when present the proof key must match it.
    pub async fn validate(
        &self,
        compact: &str,
        method: &str,
        url: &str,
        access_token: Option<&str>,
        bound_thumbprint: Option<&str>,
    ) -> Result<ProofVerification, DpopError> {
        let proof = DpopProof::parse_compact(compact)?;

        // Burn the jti first. A proof that fails any later check must not be
        // replayable against another endpoint or after a clock nudge.
        self.mark_jti(&proof.payload.jti).await?;

        self.check_request_binding(&proof, method, url)?;
        self.check_freshness(&proof)?;
        self.check_token_binding(&proof, access_token)?;
        self.check_nonce(&proof).await?;

        let thumbprint = proof.thumbprint();
        if let Some(expected) = bound_thumbprint {
            if thumbprint != expected {
                return Err(DpopError::BindingMismatch {
                    reason: "proof key does not match the token's confirmation binding"
                        .to_string(),
                });
            }
        }

        verify_signature(&proof)?;

        let issued_at = DateTime::<Utc>::from_timestamp(proof.payload.iat, 0).ok_or_else(|| {
            DpopError::MalformedProof {
                reason: "iat is outside the representable time range".to_string(),
            }
        })?;

        tracing::debug!(
            jti = %proof.payload.jti,
            thumbprint = %thumbprint,
            algorithm = %proof.algorithm,
            "proof validated"
        );

        Ok(ProofVerification {
            thumbprint,
            algorithm: proof.algorithm,
            issued_at,
        })
    }

    async fn mark_jti(&self, jti: &str) -> Result<(), DpopError> {
        // The mark must outlive the window in which the proof would still
        // be accepted, lifetime plus skew on either side.
        let ttl = self.config.proof_lifetime + self.config.iat_skew * 2;
        match self.replay.check_and_set(&jti_key(jti), ttl).await {
            Ok(SetOutcome::Inserted) => Ok(()),
            Ok(SetOutcome::AlreadyPresent) => Err(DpopError::Replayed {
                jti: jti.to_string(),
            }),
            Err(e) => Err(DpopError::StoreUnavailable {
                reason: e.to_string(),
            }),
        }
    }

    fn check_request_binding(
        &self,
        proof: &DpopProof,
        method: &str,
        url: &str,
    ) -> Result<(), DpopError> {
        if !proof.payload.htm.eq_ignore_ascii_case(method) {
            return Err(DpopError::BindingMismatch {
                reason: format!(
                    "proof is bound to {} but the request is {}",
                    proof.payload.htm,
                    method.to_ascii_uppercase()
                ),
            });
        }

        let expected = normalize_htu(url)?;
        let claimed = normalize_htu(&proof.payload.htu)?;
        if claimed != expected {
            return Err(DpopError::BindingMismatch {
                reason: format!("proof is bound to {claimed} but the request targets {expected}"),
            });
        }
        Ok(())
    }

    fn check_freshness(&self, proof: &DpopProof) -> Result<(), DpopError> {
        let now = Utc::now().timestamp();
        let iat = proof.payload.iat;
        let skew = self.config.iat_skew.as_secs() as i64;
        let lifetime = self.config.proof_lifetime.as_secs() as i64;

        if iat > now + skew {
            return Err(DpopError::Expired {
                issued_at: iat,
                reason: "issued in the future beyond tolerated skew".to_string(),
            });
        }
        if iat + lifetime + skew < now {
            return Err(DpopError::Expired {
                issued_at: iat,
                reason: "proof lifetime elapsed".to_string(),
            });
        }
        Ok(())
    }

    fn check_token_binding(
        &self,
        proof: &DpopProof,
        access_token: Option<&str>,
    ) -> Result<(), DpopError> {
        match (access_token, proof.payload.ath.as_deref()) {
            (Some(token), Some(ath)) => {
                if access_token_hash(token) != ath {
                    Err(DpopError::BindingMismatch {
                        reason: "ath does not match the presented access token".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
            (Some(_), None) => {
                if self.config.require_access_token_hash {
                    Err(DpopError::BindingMismatch {
                        reason: "access token presented but the proof carries no ath".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
            (None, Some(_)) => Err(DpopError::BindingMismatch {
                reason: "proof carries an ath but no access token was presented".to_string(),
            }),
            (None, None) => Ok(()),
        }
    }

    async fn check_nonce(&self, proof: &DpopProof) -> Result<(), DpopError> {
        let nonce = match proof.payload.nonce.as_deref() {
            Some(n) => n,
            None if self.config.require_server_nonce => {
                return Err(DpopError::BindingMismatch {
                    reason: "server nonce required but the proof carries none".to_string(),
                });
            }
            None => return Ok(()),
        };

        // An echoed nonce must be one this server issued and has not expired,
        // whether or not policy demands one.
        let live = self
            .replay
            .exists(&nonce_key(nonce))
            .await
            .map_err(|e| DpopError::StoreUnavailable {
                reason: e.to_string(),
            })?;
        if !live {
            return Err(DpopError::BindingMismatch {
                reason: "proof nonce is not a live server-issued nonce".to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) fn jti_key(jti: &str) -> String {
    format!("dpop:jti:{jti}")
}

fn verify_signature(proof: &DpopProof) -> Result<(), DpopError> {
    let key = verifying_key_from_jwk(&proof.header.jwk)?;
    let input = proof.signing_input.as_bytes();

    match (proof.algorithm, key) {
        (DpopAlgorithm::ES256, ProofVerifyingKey::P256(vk)) => {
            let sig = p256::ecdsa::Signature::try_from(proof.signature.as_slice())
                .map_err(|e| sig_invalid(format!("ECDSA signature bytes rejected: {e}")))?;
            vk.verify(input, &sig)
                .map_err(|_| sig_invalid("ECDSA verification failed"))
        }
        (DpopAlgorithm::RS256, ProofVerifyingKey::Rsa(pk)) => {
            let vk = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(pk);
            let sig = rsa::pkcs1v15::Signature::try_from(proof.signature.as_slice())
                .map_err(|e| sig_invalid(format!("RSA signature bytes rejected: {e}")))?;
            vk.verify(input, &sig)
                .map_err(|_| sig_invalid("RSA verification failed"))
        }
        (DpopAlgorithm::PS256, ProofVerifyingKey::Rsa(pk)) => {
            let vk = rsa::pss::VerifyingKey::<Sha256>::new(pk);
            let sig = rsa::pss::Signature::try_from(proof.signature.as_slice())
                .map_err(|e| sig_invalid(format!("PSS signature bytes rejected: {e}")))?;
            vk.verify(input, &sig)
                .map_err(|_| sig_invalid("PSS verification failed"))
        }
        _ => Err(sig_invalid(
            "proof algorithm does not match the embedded key type",
        )),
    }
}

fn sig_invalid(reason: impl Into<String>) -> DpopError {
    DpopError::SignatureInvalid {
        reason: reason.into(),
    }
}
