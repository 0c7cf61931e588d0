// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Deterministic key derivation from the enclave master seed.
//!
//! Every key is `HKDF-SHA256(salt = "tee-signer", ikm = seed, info)` where
//! `info` length-prefixes the version label, domain and path so no two
//! distinct triples share an encoding. If the output is not a valid
//! secp256k1 scalar the derivation retries with an incremented counter.

use std::fmt;

use hkdf::Hkdf;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::{KeyError, KeyLabel};

const HKDF_SALT: &[u8] = b"tee-signer";
const INFO_PREFIX: &[u8] = b"tee-signer-kdf/v1";

/// Retries before a derivation is declared failed.
pub const MAX_DERIVATION_ATTEMPTS: u32 = 16;

/// Minimum accepted master seed length in bytes.
pub const MIN_SEED_LEN: usize = 32;

/// Enclave master seed. Zeroized on drop, never printed.
pub struct MasterSeed(Zeroizing<Vec<u8>>);

impl MasterSeed {
    pub fn new(bytes: Vec<u8>) -> Result<Self, KeyError> {
        let bytes = Zeroizing::new(bytes);
        if bytes.len() < MIN_SEED_LEN {
            return Err(KeyError::InvalidArgument(format!(
                "master seed must be at least {MIN_SEED_LEN} bytes"
            )));
        }
        Ok(Self(bytes))
    }

    /// Parse a hex seed (optional `0x` prefix).
    pub fn from_hex(encoded: &str) -> Result<Self, KeyError> {
        let bytes = alloy::hex::decode(encoded.trim())
            .map_err(|e| KeyError::InvalidArgument(format!("master seed is not hex: {e}")))?;
        Self::new(bytes)
    }

    fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSeed([REDACTED])")
    }
}

/// A derived key pair. The private half is zeroized when this is dropped.
pub struct DerivedKey {
    signing_key: SigningKey,
    public_key: Vec<u8>,
}

impl DerivedKey {
    fn new(signing_key: SigningKey) -> Self {
        let public_key = signing_key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec();
        Self {
            signing_key,
            public_key,
        }
    }

    /// Compressed SEC1 public key (33 bytes).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Uncompressed SEC1 public key (65 bytes).
    pub fn public_key_uncompressed(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// ECDSA over a 32-byte digest. Returns fixed-width `r || s`, low-S.
    pub fn sign_prehash(&self, digest: &[u8]) -> Result<[u8; 64], KeyError> {
        if digest.len() != 32 {
            return Err(KeyError::InvalidArgument(format!(
                "digest must be 32 bytes, got {}",
                digest.len()
            )));
        }
        let signature: EcdsaSignature = self
            .signing_key
            .sign_prehash(digest)
            .map_err(|e| KeyError::Signing(e.to_string()))?;
        let signature = signature.normalize_s().unwrap_or(signature);

        let mut out = [0u8; 64];
        out.copy_from_slice(&signature.to_bytes());
        Ok(out)
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("public_key", &alloy::hex::encode(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// Derive the key for `(label, domain, path)`.
pub fn derive(
    seed: &MasterSeed,
    label: &KeyLabel,
    domain: &str,
    path: &str,
) -> Result<DerivedKey, KeyError> {
    derive_with(seed, label, domain, path, |candidate| {
        SigningKey::from_slice(candidate).ok()
    })
}

fn derive_with<F>(
    seed: &MasterSeed,
    label: &KeyLabel,
    domain: &str,
    path: &str,
    mut to_scalar: F,
) -> Result<DerivedKey, KeyError>
where
    F: FnMut(&[u8]) -> Option<SigningKey>,
{
    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), seed.expose());

    for counter in 0..MAX_DERIVATION_ATTEMPTS {
        let info = info_bytes(label, domain, path, counter);
        let mut okm = Zeroizing::new([0u8; 32]);
        hkdf.expand(&info, okm.as_mut())
            .map_err(|e| KeyError::Derivation(e.to_string()))?;

        if let Some(signing_key) = to_scalar(okm.as_ref()) {
            return Ok(DerivedKey::new(signing_key));
        }
    }

    Err(KeyError::Derivation(format!(
        "no valid scalar for {label} after {MAX_DERIVATION_ATTEMPTS} attempts"
    )))
}

fn info_bytes(label: &KeyLabel, domain: &str, path: &str, counter: u32) -> Vec<u8> {
    let mut info = Vec::with_capacity(
        INFO_PREFIX.len() + 16 + label.as_str().len() + domain.len() + path.len(),
    );
    info.extend_from_slice(INFO_PREFIX);
    for part in [label.as_str(), domain, path] {
        info.extend_from_slice(&(part.len() as u32).to_be_bytes());
        info.extend_from_slice(part.as_bytes());
    }
    info.extend_from_slice(&counter.to_be_bytes());
    info
}

/// SHA-256 of a public key, as anchored and attested.
pub fn public_key_hash(public_key: &[u8]) -> [u8; 32] {
    Sha256::digest(public_key).into()
}

/// Verify an `r || s` signature over a 32-byte digest.
pub fn verify_prehash(public_key: &[u8], digest: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_sec1_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = EcdsaSignature::from_slice(signature) else {
        return false;
    };
    key.verify_prehash(digest, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> MasterSeed {
        MasterSeed::new(vec![7u8; 32]).unwrap()
    }

    #[test]
    fn derivation_is_deterministic() {
        let label = KeyLabel::bootstrap();
        let a = derive(&seed(), &label, "signing", "").unwrap();
        let b = derive(&seed(), &label, "signing", "").unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.public_key().len(), 33);
    }

    #[test]
    fn distinct_inputs_give_distinct_keys() {
        let v1 = KeyLabel::bootstrap();
        let v2 = KeyLabel::parse("v2").unwrap();
        let base = derive(&seed(), &v1, "signing", "").unwrap();

        let other_version = derive(&seed(), &v2, "signing", "").unwrap();
        let other_domain = derive(&seed(), &v1, "oracle", "").unwrap();
        let other_path = derive(&seed(), &v1, "signing", "m/0").unwrap();

        assert_ne!(base.public_key(), other_version.public_key());
        assert_ne!(base.public_key(), other_domain.public_key());
        assert_ne!(base.public_key(), other_path.public_key());
    }

    #[test]
    fn separator_ambiguity_does_not_collide() {
        let label = KeyLabel::bootstrap();
        let a = derive(&seed(), &label, "a|b", "").unwrap();
        let b = derive(&seed(), &label, "a", "b").unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn invalid_scalar_retries_with_next_counter() {
        let label = KeyLabel::bootstrap();
        let mut calls = 0;
        let retried = derive_with(&seed(), &label, "signing", "", |candidate| {
            calls += 1;
            if calls == 1 {
                None
            } else {
                SigningKey::from_slice(candidate).ok()
            }
        })
        .unwrap();
        assert_eq!(calls, 2);

        let direct = derive(&seed(), &label, "signing", "").unwrap();
        assert_ne!(retried.public_key(), direct.public_key());
    }

    #[test]
    fn derivation_gives_up_after_cap() {
        let label = KeyLabel::bootstrap();
        let err = derive_with(&seed(), &label, "signing", "", |_| None).unwrap_err();
        assert!(matches!(err, KeyError::Derivation(_)));
    }

    #[test]
    fn signatures_verify_and_are_fixed_width() {
        let key = derive(&seed(), &KeyLabel::bootstrap(), "signing", "").unwrap();
        let digest = [0xABu8; 32];
        let signature = key.sign_prehash(&digest).unwrap();

        assert_eq!(signature.len(), 64);
        assert!(verify_prehash(key.public_key(), &digest, &signature));
        assert!(!verify_prehash(key.public_key(), &[0u8; 32], &signature));
    }

    #[test]
    fn rejects_short_seed_and_digest() {
        assert!(MasterSeed::new(vec![1u8; 8]).is_err());

        let key = derive(&seed(), &KeyLabel::bootstrap(), "signing", "").unwrap();
        assert!(matches!(
            key.sign_prehash(&[0u8; 31]),
            Err(KeyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn seed_debug_is_redacted() {
        let printed = format!("{:?}", seed());
        assert!(!printed.contains('7'));
        assert!(printed.contains("REDACTED"));
    }
}
