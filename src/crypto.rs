//! RSA PKCS#1 v1.5 signing and verification over precomputed digests.
//!
//! The digests come out of the streaming masked hasher, so both directions
//! use the prehash forms.  Verification is an opaque boolean: a padding
//! mismatch and a digest mismatch are indistinguishable to the caller.
//!
//! Key loading accepts SubjectPublicKeyInfo for public keys and PKCS#8 or
//! PKCS#1 for private keys, in PEM or DER.

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use rsa::signature::SignatureEncoding;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha384;
use std::str;

use crate::error::{MarError, Result};
use crate::signature::SignatureAlgorithm;

fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes.starts_with(b"-----")
}

/// Load a private key from PKCS#8 or PKCS#1, PEM or DER.
pub fn load_private_key(bytes: &[u8]) -> Result<RsaPrivateKey> {
    let key = if looks_like_pem(bytes) {
        let pem = str::from_utf8(bytes)
            .map_err(|_| MarError::InvalidKey("PEM key is not valid UTF-8".into()))?;
        RsaPrivateKey::from_pkcs8_pem(pem).or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
    } else {
        RsaPrivateKey::from_pkcs8_der(bytes).or_else(|_| RsaPrivateKey::from_pkcs1_der(bytes))
    };
    key.map_err(|e| MarError::InvalidKey(format!("cannot decode private key: {e}")))
}

/// Load a public key from SubjectPublicKeyInfo or PKCS#1, PEM or DER.
pub fn load_public_key(bytes: &[u8]) -> Result<RsaPublicKey> {
    let key = if looks_like_pem(bytes) {
        let pem = str::from_utf8(bytes)
            .map_err(|_| MarError::InvalidKey("PEM key is not valid UTF-8".into()))?;
        RsaPublicKey::from_public_key_pem(pem).or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
    } else {
        RsaPublicKey::from_public_key_der(bytes).or_else(|_| RsaPublicKey::from_pkcs1_der(bytes))
    };
    key.map_err(|e| MarError::InvalidKey(format!("cannot decode public key: {e}")))
}

/// Sign a digest.  The signature length equals the key's modulus length.
pub fn sign_digest(
    key: &RsaPrivateKey,
    algorithm: SignatureAlgorithm,
    digest: &[u8],
) -> Result<Vec<u8>> {
    let signature = match algorithm {
        SignatureAlgorithm::RsaPkcs1Sha1 => {
            SigningKey::<Sha1>::new(key.clone()).sign_prehash(digest)
        }
        SignatureAlgorithm::RsaPkcs1Sha384 => {
            SigningKey::<Sha384>::new(key.clone()).sign_prehash(digest)
        }
    }
    .map_err(|e| MarError::SigningFailed(e.to_string()))?;
    Ok(signature.to_vec())
}

/// Check a signature against a digest.  Returns a bare boolean; callers
/// learn nothing about which step rejected it.
pub fn verify_digest(
    key: &RsaPublicKey,
    algorithm: SignatureAlgorithm,
    digest: &[u8],
    signature: &[u8],
) -> bool {
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    match algorithm {
        SignatureAlgorithm::RsaPkcs1Sha1 => VerifyingKey::<Sha1>::new(key.clone())
            .verify_prehash(digest, &signature)
            .is_ok(),
        SignatureAlgorithm::RsaPkcs1Sha384 => VerifyingKey::<Sha384>::new(key.clone())
            .verify_prehash(digest, &signature)
            .is_ok(),
    }
}

/// A candidate public key offered for verification, tagged with the one
/// algorithm it may check.
#[derive(Debug, Clone)]
pub struct VerifyKey {
    pub algorithm: SignatureAlgorithm,
    pub key: RsaPublicKey,
}

impl VerifyKey {
    pub fn new(algorithm: SignatureAlgorithm, key: RsaPublicKey) -> Self {
        Self { algorithm, key }
    }

    /// Offer one key for every algorithm the format knows.  Convenient for
    /// callers (the CLI among them) that hold untagged keys.
    pub fn for_any_algorithm(key: RsaPublicKey) -> Vec<VerifyKey> {
        vec![
            VerifyKey::new(SignatureAlgorithm::RsaPkcs1Sha1, key.clone()),
            VerifyKey::new(SignatureAlgorithm::RsaPkcs1Sha384, key),
        ]
    }
}

/// How candidate keys are matched against signature slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerifyPolicy {
    /// Each slot must verify against at least one candidate of its
    /// algorithm.
    #[default]
    AnyKey,
    /// Each slot must verify against every candidate of its algorithm.
    /// Useful while rotating keys: prove the archive was signed by the
    /// old and the new key alike.
    RequireAll,
}
