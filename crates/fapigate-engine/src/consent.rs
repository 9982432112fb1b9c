//! Consent aggregate and its lifecycle.
//!
//! Stored status is only ever Pending, Authorized or Revoked. Expiry is
//! derived from `expires_at` at read time, never written back, so a consent
//! cannot be expired and revoked at once and no sweeper job exists. Every
//! transition bumps the aggregate version; stores apply writes with
//! compare-and-update on that version so concurrent transitions cannot both
//! win.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fapigate_core::store::StoreError;
use fapigate_core::{AccountId, ConsentId, CustomerId, GatewayError, ParticipantId, ScopeSet};

/// Stored consent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    /// Created, awaiting customer authorization
    Pending,
    /// Customer authorized access
    Authorized,
    /// Terminally withdrawn
    Revoked,
}

impl std::fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Authorized => f.write_str("authorized"),
            Self::Revoked => f.write_str("revoked"),
        }
    }
}

/// Access tier of a corporate consent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorporateTier {
    /// Only the enumerated accounts are reachable
    Restricted,
    /// Every account under the corporate relationship is reachable
    Full,
}

/// Corporate context attached to business-customer consents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorporateConsentContext {
    /// Access tier
    pub tier: CorporateTier,
    /// Accounts reachable under the Restricted tier
    pub allowed_accounts: BTreeSet<AccountId>,
}

impl CorporateConsentContext {
    /// Whether the context permits operating on an account
    pub fn allows_account(&self, account: &AccountId) -> bool {
        match self.tier {
            CorporateTier::Full => true,
            CorporateTier::Restricted => self.allowed_accounts.contains(account),
        }
    }

    /// Whether submissions under this context must name a debtor account
    pub fn requires_named_account(&self) -> bool {
        self.tier == CorporateTier::Restricted
    }
}

/// Lifecycle transition failures
#[derive(Debug, Clone, Error)]
pub enum ConsentError {
    /// The requested transition is not legal from the current status
    #[error("cannot {action} a {from} consent")]
    InvalidState {
        /// Status the consent was in
        from: ConsentStatus,
        /// Attempted action
        action: &'static str,
    },

    /// The consent's validity window has lapsed
    #[error("consent expired at {expired_at}")]
    Expired {
        /// When the window closed
        expired_at: DateTime<Utc>,
    },

    /// A supplied expiry does not lie in the future
    #[error("consent expiry must lie in the future")]
    ExpiryInPast,
}

impl From<ConsentError> for GatewayError {
    fn from(err: ConsentError) -> Self {
        match &err {
            ConsentError::InvalidState { .. } => {
                GatewayError::state_conflict("consent_invalid_state", err.to_string())
            }
            ConsentError::Expired { .. } => {
                GatewayError::state_conflict("consent_expired", err.to_string())
            }
            ConsentError::ExpiryInPast => {
                GatewayError::validation("consent_expiry_in_past", err.to_string())
            }
        }
    }
}

/// Domain event emitted by a consent transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsentEvent {
    /// A consent was created in Pending
    Created {
        /// Consent identifier
        id: ConsentId,
        /// Participant the consent belongs to
        participant: ParticipantId,
        /// Transition time
        at: DateTime<Utc>,
    },
    /// A pending consent was authorized
    Authorized {
        /// Consent identifier
        id: ConsentId,
        /// Transition time
        at: DateTime<Utc>,
    },
    /// A consent was revoked
    Revoked {
        /// Consent identifier
        id: ConsentId,
        /// Customer- or system-supplied reason
        reason: String,
        /// Transition time
        at: DateTime<Utc>,
    },
    /// An authorized consent had its expiry extended
    Renewed {
        /// Consent identifier
        id: ConsentId,
        /// New expiry
        expires_at: DateTime<Utc>,
        /// Transition time
        at: DateTime<Utc>,
    },
}

/// Consent aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consent {
    /// Aggregate identifier
    pub id: ConsentId,
    /// Participant the customer granted access through
    pub participant: ParticipantId,
    /// Granting customer
    pub customer: CustomerId,
    /// Scopes the customer granted
    pub scopes: ScopeSet,
    /// Why access was requested, recorded verbatim for the customer record
    pub purpose: String,
    /// Stored lifecycle status
    pub status: ConsentStatus,
    /// End of the validity window
    pub expires_at: DateTime<Utc>,
    /// Corporate context, present on business-customer consents
    pub corporate: Option<CorporateConsentContext>,
    /// Optimistic concurrency version, bumped on every transition
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
    /// When the customer authorized, if they have
    pub authorized_at: Option<DateTime<Utc>>,
    /// When the consent was revoked, if it has been
    pub revoked_at: Option<DateTime<Utc>>,
    /// Why the consent was revoked
    pub revocation_reason: Option<String>,
    /// Most recent renewal, if any
    pub renewed_at: Option<DateTime<Utc>>,
}

impl Consent {
    /// Create a consent in Pending with a future expiry
    pub fn create(
        id: ConsentId,
        participant: ParticipantId,
        customer: CustomerId,
        scopes: ScopeSet,
        purpose: impl Into<String>,
        expires_at: DateTime<Utc>,
        corporate: Option<CorporateConsentContext>,
    ) -> Result<(Self, ConsentEvent), ConsentError> {
        let now = Utc::now();
        if expires_at <= now {
            return Err(ConsentError::ExpiryInPast);
        }
        let consent = Self {
            id: id.clone(),
            participant: participant.clone(),
            customer,
            scopes,
            purpose: purpose.into(),
            status: ConsentStatus::Pending,
            expires_at,
            corporate,
            version: 1,
            created_at: now,
            updated_at: now,
            authorized_at: None,
            revoked_at: None,
            revocation_reason: None,
            renewed_at: None,
        };
        let event = ConsentEvent::Created {
            id,
            participant,
            at: now,
        };
        Ok((consent, event))
    }

    /// Whether the validity window has lapsed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the validity window has lapsed
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the consent currently authorizes access
    ///
    /// Active means Authorized and inside the validity window. Pending and
    /// Revoked consents are never active, whatever the clock says.
    pub fn is_active(&self) -> bool {
        self.status == ConsentStatus::Authorized && !self.is_expired()
    }

    /// Customer authorizes the pending consent
    pub fn authorize(&mut self) -> Result<ConsentEvent, ConsentError> {
        if self.status != ConsentStatus::Pending {
            return Err(ConsentError::InvalidState {
                from: self.status,
                action: "authorize",
            });
        }
        if self.is_expired() {
            return Err(ConsentError::Expired {
                expired_at: self.expires_at,
            });
        }
        self.transition(ConsentStatus::Authorized);
        self.authorized_at = Some(self.updated_at);
        Ok(ConsentEvent::Authorized {
            id: self.id.clone(),
            at: self.updated_at,
        })
    }

    /// Withdraw the consent
    ///
    /// Legal from Pending and Authorized, even past expiry: revocation is a
    /// customer-facing record, not an access decision.
    pub fn revoke(&mut self, reason: impl Into<String>) -> Result<ConsentEvent, ConsentError> {
        if self.status == ConsentStatus::Revoked {
            return Err(ConsentError::InvalidState {
                from: self.status,
                action: "revoke",
            });
        }
        let reason = reason.into();
        self.transition(ConsentStatus::Revoked);
        self.revoked_at = Some(self.updated_at);
        self.revocation_reason = Some(reason.clone());
        Ok(ConsentEvent::Revoked {
            id: self.id.clone(),
            reason,
            at: self.updated_at,
        })
    }

    /// Extend the validity window of an active consent
    pub fn renew(&mut self, expires_at: DateTime<Utc>) -> Result<ConsentEvent, ConsentError> {
        if self.status != ConsentStatus::Authorized {
            return Err(ConsentError::InvalidState {
                from: self.status,
                action: "renew",
            });
        }
        if self.is_expired() {
            return Err(ConsentError::Expired {
                expired_at: self.expires_at,
            });
        }
        if expires_at <= Utc::now() {
            return Err(ConsentError::ExpiryInPast);
        }
        self.expires_at = expires_at;
        self.transition(ConsentStatus::Authorized);
        self.renewed_at = Some(self.updated_at);
        Ok(ConsentEvent::Renewed {
            id: self.id.clone(),
            expires_at,
            at: self.updated_at,
        })
    }

    fn transition(&mut self, status: ConsentStatus) {
        self.status = status;
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

/// Outcome of a compare-and-update write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied
    Updated,
    /// The stored version moved; reload and retry
    VersionMismatch,
}

/// Storage for consent aggregates
#[async_trait]
pub trait ConsentStore: Send + Sync + std::fmt::Debug {
    /// Store a freshly created consent; ids are caller-generated UUIDs
    async fn insert(&self, consent: Consent) -> Result<(), StoreError>;

    /// Load a consent by id
    async fn get(&self, id: &ConsentId) -> Result<Option<Consent>, StoreError>;

    /// Write an updated aggregate if the stored version is still `expected_version`
    async fn compare_and_update(
        &self,
        consent: Consent,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError>;
}

/// In-memory consent store for tests and development
#[derive(Debug, Default)]
pub struct MemoryConsentStore {
    entries: DashMap<ConsentId, Consent>,
}

impl MemoryConsentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsentStore for MemoryConsentStore {
    async fn insert(&self, consent: Consent) -> Result<(), StoreError> {
        self.entries.insert(consent.id.clone(), consent);
        Ok(())
    }

    async fn get(&self, id: &ConsentId) -> Result<Option<Consent>, StoreError> {
        Ok(self.entries.get(id).map(|e| e.value().clone()))
    }

    async fn compare_and_update(
        &self,
        consent: Consent,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError> {
        // Entry lock makes check-then-write atomic per aggregate
        match self.entries.get_mut(&consent.id) {
            Some(mut entry) if entry.version == expected_version => {
                *entry = consent;
                Ok(CasOutcome::Updated)
            }
            Some(_) => Ok(CasOutcome::VersionMismatch),
            None => Ok(CasOutcome::VersionMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn fresh_consent() -> (Consent, ConsentEvent) {
        Consent::create(
            ConsentId::generate(),
            ParticipantId::new("tpp-001").unwrap(),
            CustomerId::new("cust-1").unwrap(),
            ScopeSet::from_scope_string("accounts payments"),
            "payment initiation",
            Utc::now() + ChronoDuration::days(90),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let (mut consent, created) = fresh_consent();
        assert!(matches!(created, ConsentEvent::Created { .. }));
        assert_eq!(consent.status, ConsentStatus::Pending);
        assert_eq!(consent.purpose, "payment initiation");
        assert_eq!(consent.version, 1);
        assert!(!consent.is_active());

        let authorized = consent.authorize().unwrap();
        assert!(matches!(authorized, ConsentEvent::Authorized { .. }));
        assert_eq!(consent.version, 2);
        assert!(consent.is_active());

        let revoked = consent.revoke("customer request").unwrap();
        assert!(matches!(revoked, ConsentEvent::Revoked { .. }));
        assert_eq!(consent.version, 3);
        assert!(!consent.is_active());
        assert_eq!(consent.revocation_reason.as_deref(), Some("customer request"));
        assert!(consent.revoked_at.is_some());
    }

    #[test]
    fn test_illegal_transitions_conflict() {
        let (mut consent, _) = fresh_consent();
        consent.authorize().unwrap();

        // Authorizing twice is a state conflict
        let err = consent.authorize().unwrap_err();
        assert!(matches!(
            err,
            ConsentError::InvalidState {
                from: ConsentStatus::Authorized,
                ..
            }
        ));

        consent.revoke("fraud hold").unwrap();
        assert!(matches!(
            consent.revoke("again").unwrap_err(),
            ConsentError::InvalidState { .. }
        ));
        assert!(matches!(
            consent.authorize().unwrap_err(),
            ConsentError::InvalidState { .. }
        ));
    }

    #[test]
    fn test_expiry_is_derived_not_stored() {
        let (mut consent, _) = fresh_consent();
        consent.authorize().unwrap();
        assert!(consent.is_active());

        // Moving the window into the past flips activity without a transition
        consent.expires_at = Utc::now() - ChronoDuration::seconds(1);
        assert_eq!(consent.status, ConsentStatus::Authorized);
        assert!(consent.is_expired());
        assert!(!consent.is_active());
    }

    #[test]
    fn test_expired_pending_cannot_authorize_but_can_revoke() {
        let (mut consent, _) = fresh_consent();
        consent.expires_at = Utc::now() - ChronoDuration::seconds(1);

        assert!(matches!(
            consent.authorize().unwrap_err(),
            ConsentError::Expired { .. }
        ));
        // Revocation still lands for the audit trail
        consent.revoke("customer request").unwrap();
        assert_eq!(consent.status, ConsentStatus::Revoked);
    }

    #[test]
    fn test_create_rejects_past_expiry() {
        let err = Consent::create(
            ConsentId::generate(),
            ParticipantId::new("tpp-001").unwrap(),
            CustomerId::new("cust-1").unwrap(),
            ScopeSet::from_scope_string("accounts"),
            "account information",
            Utc::now() - ChronoDuration::seconds(1),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConsentError::ExpiryInPast));
    }

    #[test]
    fn test_renew_rules() {
        let (mut consent, _) = fresh_consent();

        // Pending cannot renew
        assert!(matches!(
            consent.renew(Utc::now() + ChronoDuration::days(180)).unwrap_err(),
            ConsentError::InvalidState { .. }
        ));

        consent.authorize().unwrap();
        let event = consent.renew(Utc::now() + ChronoDuration::days(180)).unwrap();
        assert!(matches!(event, ConsentEvent::Renewed { .. }));
        assert_eq!(consent.version, 3);

        // Renewal into the past is a validation failure
        assert!(matches!(
            consent.renew(Utc::now() - ChronoDuration::days(1)).unwrap_err(),
            ConsentError::ExpiryInPast
        ));

        // An already-lapsed consent cannot renew
        consent.expires_at = Utc::now() - ChronoDuration::seconds(1);
        assert!(matches!(
            consent.renew(Utc::now() + ChronoDuration::days(1)).unwrap_err(),
            ConsentError::Expired { .. }
        ));
    }

    #[test]
    fn test_corporate_account_tiers() {
        let acc_1 = AccountId::new("acc-1").unwrap();
        let acc_2 = AccountId::new("acc-2").unwrap();

        let restricted = CorporateConsentContext {
            tier: CorporateTier::Restricted,
            allowed_accounts: [acc_1.clone()].into_iter().collect(),
        };
        assert!(restricted.allows_account(&acc_1));
        assert!(!restricted.allows_account(&acc_2));

        let full = CorporateConsentContext {
            tier: CorporateTier::Full,
            allowed_accounts: BTreeSet::new(),
        };
        assert!(full.allows_account(&acc_1));
        assert!(full.allows_account(&acc_2));
    }

    #[tokio::test]
    async fn test_store_compare_and_update() {
        let store = MemoryConsentStore::new();
        let (consent, _) = fresh_consent();
        let id = consent.id.clone();
        store.insert(consent).await.unwrap();

        // Two readers load version 1
        let mut first = store.get(&id).await.unwrap().unwrap();
        let mut second = store.get(&id).await.unwrap().unwrap();

        first.authorize().unwrap();
        assert_eq!(
            store.compare_and_update(first, 1).await.unwrap(),
            CasOutcome::Updated
        );

        // The second writer lost the race
        second.revoke("customer request").unwrap();
        assert_eq!(
            store.compare_and_update(second, 1).await.unwrap(),
            CasOutcome::VersionMismatch
        );

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConsentStatus::Authorized);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_cas_on_missing_consent_is_mismatch() {
        let store = MemoryConsentStore::new();
        let (consent, _) = fresh_consent();
        assert_eq!(
            store.compare_and_update(consent, 1).await.unwrap(),
            CasOutcome::VersionMismatch
        );
    }
}
