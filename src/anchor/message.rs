// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Master key update message.
//!
//! Signed bytes:
//!
//! ```text
//! pub_key || pub_key_hash[32] || attestation_hash[32] || nonce (uint256, big-endian)
//! ```
//!
//! The signature is ECDSA/secp256k1 over `SHA-256(signed bytes)`, encoded
//! as 64-byte `r || s`.

use alloy::primitives::{keccak256, Address, U256};
use k256::ecdsa::VerifyingKey;
use sha2::{Digest, Sha256};

use super::AnchorError;
use crate::keys::kdf::{public_key_hash, DerivedKey};
use crate::keys::KeyError;

/// A signed request to replace the anchored master key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpdate {
    pub public_key: Vec<u8>,
    pub public_key_hash: Vec<u8>,
    pub attestation_hash: Vec<u8>,
    pub nonce: U256,
    pub signature: Vec<u8>,
}

impl KeyUpdate {
    /// Build an update for `public_key`, signed by the outgoing key.
    pub fn signed_by(
        outgoing: &DerivedKey,
        public_key: &[u8],
        attestation_hash: [u8; 32],
        nonce: U256,
    ) -> Result<Self, KeyError> {
        let public_key_hash = public_key_hash(public_key);
        let digest = signing_digest(public_key, &public_key_hash, &attestation_hash, nonce);
        let signature = outgoing.sign_prehash(&digest)?;

        Ok(Self {
            public_key: public_key.to_vec(),
            public_key_hash: public_key_hash.to_vec(),
            attestation_hash: attestation_hash.to_vec(),
            nonce,
            signature: signature.to_vec(),
        })
    }

    /// Digest the outgoing key signed.
    pub fn digest(&self) -> [u8; 32] {
        signing_digest(
            &self.public_key,
            &self.public_key_hash,
            &self.attestation_hash,
            self.nonce,
        )
    }
}

pub fn signing_digest(
    public_key: &[u8],
    public_key_hash: &[u8],
    attestation_hash: &[u8],
    nonce: U256,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hasher.update(public_key_hash);
    hasher.update(attestation_hash);
    hasher.update(nonce.to_be_bytes::<32>());
    hasher.finalize().into()
}

/// Fresh 256-bit nonce.
pub fn random_nonce() -> U256 {
    use k256::elliptic_curve::rand_core::{OsRng, RngCore};

    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    U256::from_be_bytes(bytes)
}

/// EVM address of a SEC1 public key (compressed or not).
pub fn caller_address(public_key: &[u8]) -> Result<Address, AnchorError> {
    let key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| AnchorError::InvalidKey(e.to_string()))?;
    let uncompressed = key.to_encoded_point(false);
    let hash = keccak256(&uncompressed.as_bytes()[1..]);
    Ok(Address::from_slice(&hash[12..]))
}
