//! Per-participant rate limiting over the shared TTL store.
//!
//! Counting is a single atomic increment-with-TTL per call, keyed by
//! participant and operation, so every gateway instance draws down the same
//! budget. A store outage denies the request; an unavailable counter never
//! means unlimited traffic.

use std::sync::Arc;

use fapigate_core::store::TtlStore;
use fapigate_core::{GatewayError, ParticipantId};

use crate::config::RateLimitConfig;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the call fits the budget
    pub admitted: bool,
    /// Calls counted in the current window, this one included
    pub count: u64,
    /// Configured ceiling for the window
    pub limit: u64,
}

/// Fixed-window rate limiter shared across gateway instances
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn TtlStore>,
}

impl RateLimiter {
    /// Build a limiter over a shared counter store
    pub fn new(config: RateLimitConfig, store: Arc<dyn TtlStore>) -> Self {
        Self { config, store }
    }

    /// Count this call and decide admission
    ///
    /// The increment happens even for the call that overflows the budget, so
    /// sustained pressure keeps the window saturated.
    pub async fn check(
        &self,
        participant: &ParticipantId,
        operation: &str,
    ) -> Result<RateLimitDecision, GatewayError> {
        if !self.config.enabled {
            return Ok(RateLimitDecision {
                admitted: true,
                count: 0,
                limit: self.config.limit,
            });
        }

        let key = counter_key(participant, operation);
        let count = self
            .store
            .increment(&key, self.config.window)
            .await
            .map_err(|e| {
                tracing::warn!(participant = %participant, error = %e, "rate limit store unreachable");
                GatewayError::dependency_unavailable(format!("rate limit store: {e}"))
            })?;

        let admitted = count <= self.config.limit;
        if !admitted {
            tracing::warn!(
                participant = %participant,
                operation,
                count,
                limit = self.config.limit,
                "rate limit exceeded"
            );
        }
        Ok(RateLimitDecision {
            admitted,
            count,
            limit: self.config.limit,
        })
    }
}

fn counter_key(participant: &ParticipantId, operation: &str) -> String {
    format!("rl:{participant}:{operation}")
}
