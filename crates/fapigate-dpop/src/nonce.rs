//! Server-issued nonce lifecycle.
//!
//! When nonce policy is on, the gateway hands participants a fresh nonce and
//! a proof must echo one that is still live. Liveness is a TTL entry in the
//! same store the replay marks live in, so every instance sees every nonce.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;

use fapigate_core::store::TtlStore;

use crate::errors::DpopError;

/// Issues server nonces backed by the shared TTL store
#[derive(Debug)]
pub struct NonceIssuer {
    store: Arc<dyn TtlStore>,
    ttl: Duration,
}

impl NonceIssuer {
    /// Issue nonces that stay live for `ttl`
    pub fn new(store: Arc<dyn TtlStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Mint a fresh nonce and register it as live
    pub async fn issue(&self) -> Result<String, DpopError> {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let nonce = URL_SAFE_NO_PAD.encode(bytes);

        self.store
            .check_and_set(&nonce_key(&nonce), self.ttl)
            .await
            .map_err(|e| DpopError::StoreUnavailable {
                reason: e.to_string(),
            })?;
        Ok(nonce)
    }
}

pub(crate) fn nonce_key(nonce: &str) -> String {
    format!("dpop:nonce:{nonce}")
}
