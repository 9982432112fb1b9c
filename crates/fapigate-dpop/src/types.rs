//! Proof types, compact JWT parsing and key binding primitives.
//!
//! A DPoP proof arrives as a compact JWT (`header.payload.signature`, each
//! segment base64url). Parsing here is structural only: segment decoding,
//! JSON shape, the algorithm allow-list, and claim well-formedness. Binding,
//! freshness, replay and signature checks live in [`crate::validate`].
//!
//! The original encoded header and payload are retained as the signing input
//! so signature verification covers the bytes the client actually signed,
//! not a re-serialization of them.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use fapigate_core::hash::canonical_json;

use crate::errors::DpopError;
use crate::DPOP_JWT_TYPE;

/// Signature algorithms accepted for proofs
///
/// The allow-list is asymmetric only. A symmetric `alg` (HS256 and friends)
/// is rejected at parse time even though an HMAC would technically verify:
/// a shared-secret signature proves possession of nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DpopAlgorithm {
    /// ECDSA with P-256 and SHA-256
    #[serde(rename = "ES256")]
    ES256,
    /// RSA PKCS#1 v1.5 with SHA-256
    #[serde(rename = "RS256")]
    RS256,
    /// RSA PSS with SHA-256
    #[serde(rename = "PS256")]
    PS256,
}

impl DpopAlgorithm {
    /// Parse an `alg` header value against the allow-list
    pub fn parse(alg: &str) -> Result<Self, DpopError> {
        match alg {
            "ES256" => Ok(Self::ES256),
            "RS256" => Ok(Self::RS256),
            "PS256" => Ok(Self::PS256),
            other => Err(DpopError::UnsupportedAlgorithm {
                alg: other.to_string(),
            }),
        }
    }

    /// RFC 7518 algorithm name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ES256 => "ES256",
            Self::RS256 => "RS256",
            Self::PS256 => "PS256",
        }
    }
}

impl std::fmt::Display for DpopAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public key embedded in the proof header, JWK form
///
/// Only the required members of each key type are modeled; extra JWK fields
/// on inbound proofs are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    /// P-256 public key
    #[serde(rename = "EC")]
    Ec {
        /// Curve name, `P-256` for ES256
        crv: String,
        /// X coordinate, base64url
        x: String,
        /// Y coordinate, base64url
        y: String,
    },
    /// RSA public key
    #[serde(rename = "RSA")]
    Rsa {
        /// Modulus, base64url big-endian
        n: String,
        /// Public exponent, base64url big-endian
        e: String,
    },
}

impl Jwk {
    /// RFC 7638 thumbprint: SHA-256 over the canonical required-member JSON
    pub fn thumbprint(&self) -> String {
        let required = match self {
            Self::Ec { crv, x, y } => {
                serde_json::json!({"crv": crv, "kty": "EC", "x": x, "y": y})
            }
            Self::Rsa { n, e } => serde_json::json!({"e": e, "kty": "RSA", "n": n}),
        };
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&required).as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

/// Decoded proof JWT header
///
/// `alg` is kept as the raw string so an off-list algorithm surfaces as
/// [`DpopError::UnsupportedAlgorithm`] rather than a JSON shape error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofHeader {
    /// JWT type, must be `dpop+jwt`
    pub typ: String,
    /// Raw algorithm name
    pub alg: String,
    /// Public key the signature must verify against
    pub jwk: Jwk,
}

/// Decoded proof JWT payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofPayload {
    /// Unique proof id, single-use by definition
    pub jti: String,
    /// HTTP method this proof binds to
    pub htm: String,
    /// Normalized HTTP URL this proof binds to
    pub htu: String,
    /// Issued-at, Unix seconds
    pub iat: i64,
    /// base64url SHA-256 of the access token presented with the proof
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
    /// Server-issued nonce, when nonce policy is active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Parsed, structurally valid proof
#[derive(Debug, Clone)]
pub struct DpopProof {
    /// Decoded header
    pub header: ProofHeader,
    /// Decoded payload
    pub payload: ProofPayload,
    /// Algorithm, already checked against the allow-list
    pub algorithm: DpopAlgorithm,
    /// Decoded signature bytes
    pub signature: Vec<u8>,
    /// The exact `header.payload` text the signature covers
    pub signing_input: String,
}

impl DpopProof {
    /// Parse a compact serialized proof
    ///
    /// Performs every check that needs no clock, no store and no key: segment
    /// structure, JSON shape, `typ`, the algorithm allow-list, jti format,
    /// and htm/htu plausibility.
    pub fn parse_compact(compact: &str) -> Result<Self, DpopError> {
        let compact = compact.trim();
        let mut segments = compact.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(malformed("expected three dot-separated segments"));
        };

        let header_json = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|e| malformed(format!("header segment is not base64url: {e}")))?;
        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| malformed(format!("payload segment is not base64url: {e}")))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| malformed(format!("signature segment is not base64url: {e}")))?;

        let header: ProofHeader = serde_json::from_slice(&header_json)
            .map_err(|e| malformed(format!("header is not a DPoP JWT header: {e}")))?;
        let payload: ProofPayload = serde_json::from_slice(&payload_json)
            .map_err(|e| malformed(format!("payload is not a DPoP JWT payload: {e}")))?;

        if header.typ != DPOP_JWT_TYPE {
            return Err(malformed(format!(
                "typ '{}' is not '{DPOP_JWT_TYPE}'",
                header.typ
            )));
        }
        let algorithm = DpopAlgorithm::parse(&header.alg)?;

        if Uuid::parse_str(&payload.jti).is_err() {
            return Err(malformed("jti is not a UUID"));
        }
        if !is_valid_http_method(&payload.htm) {
            return Err(malformed(format!("htm '{}' is not an HTTP method", payload.htm)));
        }
        if !payload.htu.starts_with("https://") && !payload.htu.starts_with("http://") {
            return Err(malformed(format!("htu '{}' is not an HTTP URL", payload.htu)));
        }

        Ok(Self {
            header,
            payload,
            algorithm,
            signature,
            signing_input: format!("{header_b64}.{payload_b64}"),
        })
    }

    /// RFC 7638 thumbprint of the embedded public key
    pub fn thumbprint(&self) -> String {
        self.header.jwk.thumbprint()
    }
}

/// Outcome of a successful proof validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofVerification {
    /// Thumbprint of the key that signed the proof
    pub thumbprint: String,
    /// Algorithm the proof was signed with
    pub algorithm: DpopAlgorithm,
    /// Proof `iat` as a UTC timestamp
    pub issued_at: DateTime<Utc>,
}

/// base64url SHA-256 digest of an access token, the `ath` claim value
pub fn access_token_hash(access_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(access_token.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Normalize a URL to its htu form
///
/// Keeps scheme, host, non-default port and path; strips query and fragment;
/// trims a trailing slash everywhere except the root path. Both the proof
/// claim and the actual request URL go through this before comparison.
pub fn normalize_htu(uri: &str) -> Result<String, DpopError> {
    let parsed = url::Url::parse(uri)
        .map_err(|e| malformed(format!("URL '{uri}' does not parse: {e}")))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| malformed(format!("URL '{uri}' has no host")))?;
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let path = match parsed.path() {
        "/" => "/",
        p => p.trim_end_matches('/'),
    };

    Ok(format!("{}://{}{}", parsed.scheme(), authority, path))
}

fn is_valid_http_method(method: &str) -> bool {
    matches!(
        method.to_ascii_uppercase().as_str(),
        "GET" | "POST" | "PUT" | "DELETE" | "PATCH" | "HEAD" | "OPTIONS"
    )
}

fn malformed(reason: impl Into<String>) -> DpopError {
    DpopError::MalformedProof {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_segments(header: &serde_json::Value, payload: &serde_json::Value) -> String {
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(payload.to_string()),
            URL_SAFE_NO_PAD.encode([0u8; 64])
        )
    }

    fn ec_header(alg: &str) -> serde_json::Value {
        serde_json::json!({
            "typ": "dpop+jwt",
            "alg": alg,
            "jwk": {"kty": "EC", "crv": "P-256", "x": "AAAA", "y": "BBBB"}
        })
    }

    fn payload() -> serde_json::Value {
        serde_json::json!({
            "jti": Uuid::new_v4().to_string(),
            "htm": "POST",
            "htu": "https://api.bank.example/payments",
            "iat": 1_700_000_000
        })
    }

    #[test]
    fn test_parse_well_formed_proof() {
        let compact = encode_segments(&ec_header("ES256"), &payload());
        let proof = DpopProof::parse_compact(&compact).unwrap();
        assert_eq!(proof.algorithm, DpopAlgorithm::ES256);
        assert_eq!(proof.payload.htm, "POST");
        assert_eq!(proof.signature.len(), 64);
        // The signing input is the original encoded text, not a re-serialization
        assert!(compact.starts_with(&proof.signing_input));
    }

    #[test]
    fn test_symmetric_algorithm_is_rejected_as_unsupported() {
        let compact = encode_segments(&ec_header("HS256"), &payload());
        let err = DpopProof::parse_compact(&compact).unwrap_err();
        assert!(matches!(err, DpopError::UnsupportedAlgorithm { alg } if alg == "HS256"));
    }

    #[test]
    fn test_wrong_typ_is_malformed() {
        let mut header = ec_header("ES256");
        header["typ"] = serde_json::json!("jwt");
        let err = DpopProof::parse_compact(&encode_segments(&header, &payload())).unwrap_err();
        assert!(matches!(err, DpopError::MalformedProof { .. }));
    }

    #[test]
    fn test_non_uuid_jti_is_malformed() {
        let mut p = payload();
        p["jti"] = serde_json::json!("not-a-uuid");
        let err = DpopProof::parse_compact(&encode_segments(&ec_header("ES256"), &p)).unwrap_err();
        assert!(matches!(err, DpopError::MalformedProof { .. }));
    }

    #[test]
    fn test_segment_count_enforced() {
        assert!(DpopProof::parse_compact("onlyonesegment").is_err());
        assert!(DpopProof::parse_compact("a.b").is_err());
        assert!(DpopProof::parse_compact("a.b.c.d").is_err());
    }

    #[test]
    fn test_htu_normalization() {
        assert_eq!(
            normalize_htu("https://api.bank.example/payments?batch=1#frag").unwrap(),
            "https://api.bank.example/payments"
        );
        assert_eq!(
            normalize_htu("https://api.bank.example/payments/").unwrap(),
            "https://api.bank.example/payments"
        );
        assert_eq!(
            normalize_htu("https://api.bank.example/").unwrap(),
            "https://api.bank.example/"
        );
        assert_eq!(
            normalize_htu("https://api.bank.example:8443/consents").unwrap(),
            "https://api.bank.example:8443/consents"
        );
        // Default port collapses into the bare authority
        assert_eq!(
            normalize_htu("https://api.bank.example:443/consents").unwrap(),
            "https://api.bank.example/consents"
        );
    }

    #[test]
    fn test_thumbprint_ignores_key_order_and_extras() {
        let a: Jwk = serde_json::from_value(serde_json::json!(
            {"kty": "EC", "crv": "P-256", "x": "xx", "y": "yy"}
        ))
        .unwrap();
        let b: Jwk = serde_json::from_value(serde_json::json!(
            {"y": "yy", "x": "xx", "crv": "P-256", "kty": "EC", "use": "sig"}
        ))
        .unwrap();
        assert_eq!(a.thumbprint(), b.thumbprint());
        assert_eq!(a.thumbprint().len(), 43); // 32 bytes base64url, unpadded
    }

    #[test]
    fn test_access_token_hash_is_base64url_sha256() {
        // SHA-256("token") cross-checked against a reference implementation
        assert_eq!(
            access_token_hash("token"),
            "PEaenWxYddN6Q_NT1PiOYfz4EsZu7jRXRlpAsNpBU-A"
        );
        assert_ne!(access_token_hash("token"), access_token_hash("token2"));
    }
}
