//! Identifier and value newtypes used across the gateway.
//!
//! Every type here is constructed through a validating factory; once a value
//! exists it is known to be well-formed. Header parsing and request intake go
//! through these factories so the rest of the engine never re-validates.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::MAX_IDEMPOTENCY_KEY_LEN;

/// RFC 4122 interaction identifier echoed on every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InteractionId(Uuid);

impl InteractionId {
    /// Generate a fresh interaction id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an interaction id from its header representation
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        Uuid::parse_str(raw.trim()).map(Self).map_err(|_| {
            GatewayError::validation(
                "invalid_interaction_id",
                format!("interaction id '{raw}' is not a UUID"),
            )
        })
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for InteractionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident, $code:literal, $what:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Construct from a raw value, rejecting empty or oversized input
            pub fn new(raw: impl Into<String>) -> Result<Self, GatewayError> {
                let raw = raw.into();
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(GatewayError::validation(
                        $code,
                        concat!($what, " must not be empty"),
                    ));
                }
                if trimmed.len() > 128 {
                    return Err(GatewayError::validation(
                        $code,
                        concat!($what, " exceeds 128 characters"),
                    ));
                }
                Ok(Self(trimmed.to_string()))
            }

            /// Generate a fresh random identifier
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Borrow the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Third-party provider (TPP) identifier, the tenant keys are scoped by
    ParticipantId,
    "invalid_participant_id",
    "participant id"
);
opaque_id!(
    /// Customer identifier a consent is granted by
    CustomerId,
    "invalid_customer_id",
    "customer id"
);
opaque_id!(
    /// Consent aggregate identifier
    ConsentId,
    "invalid_consent_id",
    "consent id"
);
opaque_id!(
    /// Bulk payment file identifier
    FileId,
    "invalid_file_id",
    "file id"
);
opaque_id!(
    /// Identifier of an executed command (payment, bulk intake)
    OperationId,
    "invalid_operation_id",
    "operation id"
);
opaque_id!(
    /// Account identifier checked against consent allow-lists
    AccountId,
    "invalid_account_id",
    "account id"
);

/// Client-supplied idempotency key, scoped per participant
///
/// Keys are opaque but bounded (1..=40 visible characters per the Open
/// Banking idempotency header convention).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Construct from the raw header value
    pub fn new(raw: impl Into<String>) -> Result<Self, GatewayError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(GatewayError::validation(
                "invalid_idempotency_key",
                "idempotency key must not be empty",
            ));
        }
        if raw.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(GatewayError::validation(
                "invalid_idempotency_key",
                format!("idempotency key exceeds {MAX_IDEMPOTENCY_KEY_LEN} characters"),
            ));
        }
        if !raw.chars().all(|c| c.is_ascii_graphic()) {
            return Err(GatewayError::validation(
                "invalid_idempotency_key",
                "idempotency key must be visible ASCII",
            ));
        }
        Ok(Self(raw))
    }

    /// Borrow the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monetary amount in minor units (e.g. cents)
///
/// Stored signed so arithmetic can detect underflow, but aggregate
/// boundaries require positive amounts before accepting an instruction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    /// Zero amount
    pub const ZERO: Self = Self(0);

    /// Construct from minor units
    pub const fn from_minor_units(units: i64) -> Self {
        Self(units)
    }

    /// Minor-unit value
    pub const fn minor_units(self) -> i64 {
        self.0
    }

    /// Check whether the amount is strictly positive
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Checked addition, `None` on overflow
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated International Bank Account Number
///
/// Construction normalizes case and spacing and verifies the ISO 13616
/// charset, length bounds and mod-97 checksum, so downstream item validation
/// is a plain constructor call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Iban(String);

impl Iban {
    /// Parse and validate an IBAN
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let normalized: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.len() < 15 || normalized.len() > 34 {
            return Err(GatewayError::validation(
                "invalid_iban",
                format!("IBAN length {} outside 15..=34", normalized.len()),
            ));
        }
        if !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(GatewayError::validation(
                "invalid_iban",
                "IBAN contains characters outside A-Z0-9",
            ));
        }
        if !normalized.chars().take(2).all(|c| c.is_ascii_alphabetic()) {
            return Err(GatewayError::validation(
                "invalid_iban",
                "IBAN must start with a two-letter country code",
            ));
        }
        if mod_97(&normalized) != 1 {
            return Err(GatewayError::validation(
                "invalid_iban",
                "IBAN checksum failed",
            ));
        }
        Ok(Self(normalized))
    }

    /// Borrow the normalized IBAN
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-letter country code
    pub fn country_code(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for Iban {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ISO 13616 mod-97 checksum over the rearranged IBAN
fn mod_97(iban: &str) -> u32 {
    let rearranged = iban
        .chars()
        .skip(4)
        .chain(iban.chars().take(4))
        .collect::<String>();

    let mut remainder: u32 = 0;
    for c in rearranged.chars() {
        if let Some(digit) = c.to_digit(10) {
            remainder = (remainder * 10 + digit) % 97;
        } else {
            // Letters map to 10..=35 and contribute two digits
            let value = u32::from(c as u8 - b'A') + 10;
            remainder = (remainder * 100 + value) % 97;
        }
    }
    remainder
}
