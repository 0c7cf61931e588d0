// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # API Data Models
//!
//! Request and response bodies of the REST API. Binary fields (payloads,
//! signatures, public keys, hashes) are hex strings; a `0x` prefix is
//! accepted on input and never emitted.
//!
//! ## Model Categories
//!
//! - **Signing**: raw and domain-separated signatures
//! - **Keys**: derivation, active version, attestations
//! - **Anchor**: nonce lookups against the local verifier
//! - **Admin**: rotation and anchor confirmation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::keys::domain::{DomainRequest, SigningPurpose};
use crate::keys::manager::{DerivedPublicKey, DomainSignature, KeyRingSnapshot};
use crate::keys::{KeyError, KeyStatus, RotationOutcome, Signature};

/// Decode a hex field, naming it in the error.
pub fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, KeyError> {
    alloy::hex::decode(value.trim())
        .map_err(|e| KeyError::InvalidArgument(format!("{field} is not valid hex: {e}")))
}

fn decode_hash(field: &str, value: &str) -> Result<[u8; 32], KeyError> {
    let bytes = decode_hex(field, value)?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        KeyError::InvalidArgument(format!("{field} must be 32 bytes, got {}", bytes.len()))
    })
}

// =============================================================================
// Signing
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SignRequest {
    /// 32-byte payload hash, hex.
    pub payload: String,
    /// Version to sign with; the active version when omitted.
    #[serde(default)]
    pub key_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SignResponse {
    /// 64-byte `r || s`, hex.
    pub signature: String,
    pub key_version: String,
}

impl From<Signature> for SignResponse {
    fn from(signed: Signature) -> Self {
        Self {
            signature: alloy::hex::encode(signed.signature),
            key_version: signed.key_version.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DomainSignRequest {
    pub purpose: SigningPurpose,
    pub service_id: String,
    pub chain_id: String,
    pub request_id: String,
    /// 32-byte hash of the service payload, hex.
    pub payload_hash: String,
    /// Unix seconds; must be in the future.
    pub expiry: i64,
    #[serde(default)]
    pub key_version: Option<String>,
}

impl DomainSignRequest {
    pub fn to_domain_request(&self) -> Result<DomainRequest, KeyError> {
        Ok(DomainRequest {
            purpose: self.purpose,
            service_id: self.service_id.clone(),
            chain_id: self.chain_id.clone(),
            request_id: self.request_id.clone(),
            payload_hash: decode_hash("payload_hash", &self.payload_hash)?,
            expiry: self.expiry,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DomainSignResponse {
    pub signature: String,
    pub key_version: String,
    pub signed_at: DateTime<Utc>,
    pub domain_hash: String,
}

impl From<DomainSignature> for DomainSignResponse {
    fn from(signed: DomainSignature) -> Self {
        Self {
            signature: alloy::hex::encode(signed.signature),
            key_version: signed.key_version.to_string(),
            signed_at: signed.signed_at,
            domain_hash: alloy::hex::encode(signed.domain_hash),
        }
    }
}

// =============================================================================
// Keys
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeriveRequest {
    pub domain: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub key_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeriveResponse {
    /// Compressed SEC1 public key, hex.
    pub public_key: String,
    pub key_version: String,
}

impl From<DerivedPublicKey> for DeriveResponse {
    fn from(derived: DerivedPublicKey) -> Self {
        Self {
            public_key: alloy::hex::encode(derived.public_key),
            key_version: derived.key_version.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ActiveKeyResponse {
    pub key_version: String,
    /// Root signing public key of the active version, hex.
    pub public_key: String,
    /// Versions still accepted for signing (active and overlapping).
    pub usable_versions: Vec<String>,
    pub next_rotation_at: Option<DateTime<Utc>>,
    pub degraded: bool,
}

impl ActiveKeyResponse {
    pub fn new(public: DerivedPublicKey, snapshot: &KeyRingSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            key_version: public.key_version.to_string(),
            public_key: alloy::hex::encode(public.public_key),
            usable_versions: snapshot
                .versions
                .iter()
                .filter(|v| v.is_usable_at(now))
                .map(|v| v.label.to_string())
                .collect(),
            next_rotation_at: snapshot.next_rotation_at,
            degraded: snapshot.degraded,
        }
    }
}

// =============================================================================
// Admin
// =============================================================================

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RotateResponse {
    pub old_version: String,
    pub new_version: String,
    /// `active`, or `pending` while awaiting anchor confirmation.
    pub status: KeyStatus,
    pub overlap_ends_at: Option<DateTime<Utc>>,
    pub rotated_at: DateTime<Utc>,
    pub persisted: bool,
    pub anchor_tx: Option<String>,
}

impl From<RotationOutcome> for RotateResponse {
    fn from(outcome: RotationOutcome) -> Self {
        Self {
            old_version: outcome.previous_version.to_string(),
            new_version: outcome.new_version.to_string(),
            status: outcome.status,
            overlap_ends_at: outcome.overlap_ends_at,
            rotated_at: outcome.rotated_at,
            persisted: outcome.persisted,
            anchor_tx: outcome.anchor_tx,
        }
    }
}

// =============================================================================
// Anchor
// =============================================================================

/// Whether the local verifier has consumed a nonce.
#[derive(Debug, Serialize, ToSchema)]
pub struct NonceStatusResponse {
    /// Decimal nonce.
    pub nonce: String,
    pub used: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_accepts_prefix_and_checks_width() {
        let hash = format!("0x{}", "ab".repeat(32));
        assert_eq!(decode_hash("payload", &hash).unwrap(), [0xab; 32]);
        assert!(decode_hash("payload", "abcd").is_err());
        assert!(decode_hex("payload", "zz").is_err());
    }

    #[test]
    fn domain_request_parses_purpose() {
        let body = serde_json::json!({
            "purpose": "vrf",
            "service_id": "randomness",
            "chain_id": "1",
            "request_id": "r-7",
            "payload_hash": "11".repeat(32),
            "expiry": 1_900_000_000i64
        });
        let request: DomainSignRequest = serde_json::from_value(body).unwrap();
        let domain = request.to_domain_request().unwrap();
        assert_eq!(domain.purpose, SigningPurpose::Vrf);
        assert_eq!(domain.payload_hash, [0x11; 32]);
        assert!(request.key_version.is_none());
    }
}
