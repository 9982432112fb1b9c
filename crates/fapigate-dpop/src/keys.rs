//! Key material for the signing side of proof-of-possession.
//!
//! The gateway itself never holds client private keys. This module exists for
//! the participant-facing half: generating a key pair, exporting its public
//! JWK, and reconstructing verification keys from the JWK a proof carries.
//! Private material is zeroized on drop.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::errors::DpopError;
use crate::types::{DpopAlgorithm, Jwk};

/// Private key material, zeroized on drop
#[derive(Clone)]
pub enum PrivateKeyMaterial {
    /// P-256 scalar in SEC1 form
    EcP256 {
        /// Raw 32-byte scalar
        key_bytes: [u8; 32],
    },
    /// RSA private key in PKCS#8 DER form
    Rsa {
        /// DER-encoded key
        key_der: Vec<u8>,
    },
}

impl Zeroize for PrivateKeyMaterial {
    fn zeroize(&mut self) {
        match self {
            Self::EcP256 { key_bytes } => key_bytes.zeroize(),
            Self::Rsa { key_der } => key_der.zeroize(),
        }
    }
}

impl Drop for PrivateKeyMaterial {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl std::fmt::Debug for PrivateKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EcP256 { .. } => f.write_str("PrivateKeyMaterial::EcP256(..)"),
            Self::Rsa { .. } => f.write_str("PrivateKeyMaterial::Rsa(..)"),
        }
    }
}

/// An asymmetric key pair a participant signs proofs with
#[derive(Debug, Clone)]
pub struct KeyPair {
    algorithm: DpopAlgorithm,
    private_key: PrivateKeyMaterial,
    public_jwk: Jwk,
    thumbprint: String,
}

impl KeyPair {
    /// Generate a fresh key pair for the given algorithm
    ///
    /// RSA keys are 2048 bit, the minimum the profile accepts.
    pub fn generate(algorithm: DpopAlgorithm) -> Result<Self, DpopError> {
        let (private_key, public_jwk) = match algorithm {
            DpopAlgorithm::ES256 => generate_p256()?,
            DpopAlgorithm::RS256 | DpopAlgorithm::PS256 => generate_rsa(2048)?,
        };
        let thumbprint = public_jwk.thumbprint();
        Ok(Self {
            algorithm,
            private_key,
            public_jwk,
            thumbprint,
        })
    }

    /// Algorithm this key signs with
    pub fn algorithm(&self) -> DpopAlgorithm {
        self.algorithm
    }

    /// Public half as a JWK, embeddable in proof headers
    pub fn public_jwk(&self) -> &Jwk {
        &self.public_jwk
    }

    /// RFC 7638 thumbprint of the public half
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub(crate) fn private_key(&self) -> &PrivateKeyMaterial {
        &self.private_key
    }
}

fn generate_p256() -> Result<(PrivateKeyMaterial, Jwk), DpopError> {
    use p256::ecdsa::{SigningKey, VerifyingKey};

    let signing_key = SigningKey::random(&mut OsRng);
    let verifying_key = VerifyingKey::from(&signing_key);

    let point = verifying_key.to_encoded_point(false);
    let x = point.x().ok_or_else(|| signing_failed("P-256 point has no X coordinate"))?;
    let y = point.y().ok_or_else(|| signing_failed("P-256 point has no Y coordinate"))?;

    let private = PrivateKeyMaterial::EcP256 {
        key_bytes: signing_key.to_bytes().into(),
    };
    let jwk = Jwk::Ec {
        crv: "P-256".to_string(),
        x: URL_SAFE_NO_PAD.encode(x),
        y: URL_SAFE_NO_PAD.encode(y),
    };
    Ok((private, jwk))
}

fn generate_rsa(bits: usize) -> Result<(PrivateKeyMaterial, Jwk), DpopError> {
    use rsa::{pkcs8::EncodePrivateKey, traits::PublicKeyParts, RsaPrivateKey};

    let private_key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| signing_failed(format!("RSA key generation failed: {e}")))?;
    let public_key = private_key.to_public_key();

    let key_der = private_key
        .to_pkcs8_der()
        .map_err(|e| signing_failed(format!("RSA private key encoding failed: {e}")))?
        .as_bytes()
        .to_vec();

    let private = PrivateKeyMaterial::Rsa { key_der };
    let jwk = Jwk::Rsa {
        n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
    };
    Ok((private, jwk))
}

/// Public key reconstructed from the JWK embedded in a proof
#[derive(Debug)]
pub(crate) enum ProofVerifyingKey {
    P256(p256::ecdsa::VerifyingKey),
    Rsa(rsa::RsaPublicKey),
}

/// Rebuild a verification key from JWK members
///
/// A key that decodes but does not sit on the curve, or RSA parameters the
/// backend refuses, surface as an invalid signature: the proof can never
/// verify against such a key.
pub(crate) fn verifying_key_from_jwk(jwk: &Jwk) -> Result<ProofVerifyingKey, DpopError> {
    match jwk {
        Jwk::Ec { crv, x, y } => {
            if crv != "P-256" {
                return Err(DpopError::UnsupportedAlgorithm {
                    alg: format!("EC curve {crv}"),
                });
            }
            let x = decode_coordinate(x, "x")?;
            let y = decode_coordinate(y, "y")?;
            let point = p256::EncodedPoint::from_affine_coordinates(
                p256::FieldBytes::from_slice(&x),
                p256::FieldBytes::from_slice(&y),
                false,
            );
            let key = p256::ecdsa::VerifyingKey::from_encoded_point(&point).map_err(|e| {
                DpopError::SignatureInvalid {
                    reason: format!("JWK is not a valid P-256 point: {e}"),
                }
            })?;
            Ok(ProofVerifyingKey::P256(key))
        }
        Jwk::Rsa { n, e } => {
            let n = URL_SAFE_NO_PAD.decode(n).map_err(|e| DpopError::MalformedProof {
                reason: format!("JWK modulus is not base64url: {e}"),
            })?;
            let e = URL_SAFE_NO_PAD.decode(e).map_err(|e| DpopError::MalformedProof {
                reason: format!("JWK exponent is not base64url: {e}"),
            })?;
            let key = rsa::RsaPublicKey::new(
                rsa::BigUint::from_bytes_be(&n),
                rsa::BigUint::from_bytes_be(&e),
            )
            .map_err(|e| DpopError::SignatureInvalid {
                reason: format!("JWK is not a usable RSA key: {e}"),
            })?;
            Ok(ProofVerifyingKey::Rsa(key))
        }
    }
}

fn decode_coordinate(value: &str, name: &str) -> Result<[u8; 32], DpopError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| DpopError::MalformedProof {
            reason: format!("JWK {name} coordinate is not base64url: {e}"),
        })?;
    bytes.try_into().map_err(|_| DpopError::MalformedProof {
        reason: format!("JWK {name} coordinate is not 32 bytes"),
    })
}

fn signing_failed(reason: impl Into<String>) -> DpopError {
    DpopError::SigningFailed {
        reason: reason.into(),
    }
}
