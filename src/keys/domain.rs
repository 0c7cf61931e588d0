// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Domain-separated signing messages.
//!
//! ```text
//! domain_hash = SHA256(purpose 0x00 service_id 0x00 chain_id 0x00 request_id 0x00
//!                      payload_hash[32] expiry_be_u64)
//! message     = SHA256("NEO-SERVICE-LAYER-V1" || domain_hash)
//! ```
//!
//! Verifiers on-chain rebuild `message` from the same fields, so a signature
//! issued for one purpose, service, chain or request can never be replayed
//! under another.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use super::KeyError;

/// Prefix mixed into every domain-separated message.
pub const DOMAIN_SEPARATION_PREFIX: &[u8] = b"NEO-SERVICE-LAYER-V1";

/// What a domain-separated signature is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SigningPurpose {
    Oracle,
    Vrf,
    Automation,
    Privacy,
    Registry,
    AccountPool,
}

impl SigningPurpose {
    pub const ALL: [SigningPurpose; 6] = [
        SigningPurpose::Oracle,
        SigningPurpose::Vrf,
        SigningPurpose::Automation,
        SigningPurpose::Privacy,
        SigningPurpose::Registry,
        SigningPurpose::AccountPool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SigningPurpose::Oracle => "oracle",
            SigningPurpose::Vrf => "vrf",
            SigningPurpose::Automation => "automation",
            SigningPurpose::Privacy => "privacy",
            SigningPurpose::Registry => "registry",
            SigningPurpose::AccountPool => "accountpool",
        }
    }
}

impl fmt::Display for SigningPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningPurpose {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SigningPurpose::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| KeyError::InvalidArgument(format!("invalid purpose: {s}")))
    }
}

/// Fields bound into a domain-separated signature.
#[derive(Debug, Clone)]
pub struct DomainRequest {
    pub purpose: SigningPurpose,
    pub service_id: String,
    pub chain_id: String,
    pub request_id: String,
    pub payload_hash: [u8; 32],
    /// Unix seconds after which the signature must not be accepted.
    pub expiry: i64,
}

impl DomainRequest {
    /// Reject empty identifiers and expiries that are not in the future.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), KeyError> {
        for (field, value) in [
            ("service_id", self.service_id.as_str()),
            ("chain_id", self.chain_id.as_str()),
            ("request_id", self.request_id.as_str()),
        ] {
            if value.is_empty() {
                return Err(KeyError::InvalidArgument(format!("{field} is required")));
            }
            if value.as_bytes().contains(&0) {
                return Err(KeyError::InvalidArgument(format!(
                    "{field} must not contain NUL bytes"
                )));
            }
        }
        if self.expiry <= 0 {
            return Err(KeyError::InvalidArgument(
                "expiry is required and must be positive".to_string(),
            ));
        }
        if self.expiry < now.timestamp() {
            return Err(KeyError::InvalidArgument(
                "expiry must be in the future".to_string(),
            ));
        }
        Ok(())
    }

    pub fn domain_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for part in [
            self.purpose.as_str(),
            self.service_id.as_str(),
            self.chain_id.as_str(),
            self.request_id.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.payload_hash);
        hasher.update((self.expiry as u64).to_be_bytes());
        hasher.finalize().into()
    }

    /// The 32-byte digest that is actually signed.
    pub fn signing_message(&self) -> [u8; 32] {
        signing_message(&self.domain_hash())
    }
}

pub fn signing_message(domain_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_SEPARATION_PREFIX);
    hasher.update(domain_hash);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request() -> DomainRequest {
        DomainRequest {
            purpose: SigningPurpose::Oracle,
            service_id: "datafeeds".to_string(),
            chain_id: "43113".to_string(),
            request_id: "req-1".to_string(),
            payload_hash: [0x11; 32],
            expiry: 2_000,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn domain_hash_matches_manual_layout() {
        let req = request();
        let mut manual = Vec::new();
        manual.extend_from_slice(b"oracle\0datafeeds\x0043113\0req-1\0");
        manual.extend_from_slice(&[0x11; 32]);
        manual.extend_from_slice(&2_000u64.to_be_bytes());

        let expected: [u8; 32] = Sha256::digest(&manual).into();
        assert_eq!(req.domain_hash(), expected);
    }

    #[test]
    fn any_field_changes_the_message() {
        let base = request().signing_message();

        let mut other = request();
        other.purpose = SigningPurpose::Vrf;
        assert_ne!(other.signing_message(), base);

        let mut other = request();
        other.chain_id = "1".to_string();
        assert_ne!(other.signing_message(), base);

        let mut other = request();
        other.expiry += 1;
        assert_ne!(other.signing_message(), base);
    }

    #[test]
    fn validation_rules() {
        assert!(request().validate(at(1_000)).is_ok());
        assert!(request().validate(at(3_000)).is_err());

        let mut missing = request();
        missing.service_id.clear();
        assert!(missing.validate(at(1_000)).is_err());

        let mut nul = request();
        nul.request_id = "a\0b".to_string();
        assert!(nul.validate(at(1_000)).is_err());
    }

    #[test]
    fn purposes_parse() {
        for purpose in SigningPurpose::ALL {
            assert_eq!(purpose.as_str().parse::<SigningPurpose>().unwrap(), purpose);
        }
        assert!("payments".parse::<SigningPurpose>().is_err());
    }
}
