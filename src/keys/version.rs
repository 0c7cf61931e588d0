// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Key version records and their lifecycle.
//!
//! ```text
//! pending --(anchor confirmed / anchoring off)--> active
//! active  --(rotate)--> overlapping --(now > overlap_ends_at)--> revoked
//! ```
//!
//! `revoked` is terminal. A pending version whose rotation is aborted goes
//! straight to `revoked`.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::KeyError;

/// Label of the bootstrap / fallback version.
pub const BOOTSTRAP_LABEL: &str = "v1";

/// Monotonic key version label (`v<unix-seconds>`, or `v1`).
///
/// Labels order numerically, so `v9 < v10 < v1700000000`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct KeyLabel(String);

impl KeyLabel {
    /// Parse and normalize a label. Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KeyError::InvalidArgument(
                "key_version cannot be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The bootstrap label `v1`.
    pub fn bootstrap() -> Self {
        Self(BOOTSTRAP_LABEL.to_string())
    }

    /// Label derived from a timestamp.
    pub fn from_time(at: DateTime<Utc>) -> Self {
        Self(format!("v{}", at.timestamp().max(0)))
    }

    /// Next label at `now`, strictly greater than `highest` when given.
    pub fn next(now: DateTime<Utc>, highest: Option<&KeyLabel>) -> Self {
        let candidate = now.timestamp().max(0) as u64;
        let floor = highest
            .and_then(KeyLabel::ordinal)
            .map(|n| n.saturating_add(1))
            .unwrap_or(0);
        Self(format!("v{}", candidate.max(floor)))
    }

    /// Numeric component of a `v<digits>` label.
    pub fn ordinal(&self) -> Option<u64> {
        self.0.strip_prefix('v').and_then(|n| n.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for KeyLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.ordinal(), other.ordinal()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for KeyLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for KeyLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a key version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Pending,
    Active,
    Overlapping,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Pending => "pending",
            KeyStatus::Active => "active",
            KeyStatus::Overlapping => "overlapping",
            KeyStatus::Revoked => "revoked",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: KeyStatus) -> bool {
        matches!(
            (self, next),
            (KeyStatus::Pending, KeyStatus::Active)
                | (KeyStatus::Pending, KeyStatus::Revoked)
                | (KeyStatus::Active, KeyStatus::Overlapping)
                | (KeyStatus::Overlapping, KeyStatus::Revoked)
        )
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeyStatus {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(KeyStatus::Pending),
            "active" => Ok(KeyStatus::Active),
            "overlapping" => Ok(KeyStatus::Overlapping),
            "revoked" => Ok(KeyStatus::Revoked),
            other => Err(KeyError::InvalidArgument(format!(
                "unknown key status: {other}"
            ))),
        }
    }
}

/// Persisted lifecycle record of one key version. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct KeyVersion {
    #[schema(value_type = String)]
    pub label: KeyLabel,
    pub status: KeyStatus,
    pub valid_from: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap_ends_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl KeyVersion {
    /// A freshly minted version, valid from `now`.
    pub fn new(label: KeyLabel, status: KeyStatus, now: DateTime<Utc>) -> Self {
        Self {
            label,
            status,
            valid_from: now,
            overlap_ends_at: None,
            revoked_at: None,
            created_at: now,
        }
    }

    /// Status as observed at `now`: an overlapping version past its
    /// deadline is already revoked even if nobody has persisted that yet.
    pub fn status_at(&self, now: DateTime<Utc>) -> KeyStatus {
        match (self.status, self.overlap_ends_at) {
            (KeyStatus::Overlapping, Some(ends)) if now > ends => KeyStatus::Revoked,
            (status, _) => status,
        }
    }

    /// Whether this version may sign at `now`.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status_at(now),
            KeyStatus::Active | KeyStatus::Overlapping
        )
    }

    /// `active -> overlapping` with a deadline of `now + overlap`.
    pub fn demote(&mut self, now: DateTime<Utc>, overlap: Duration) -> Result<(), KeyError> {
        self.check_transition(KeyStatus::Overlapping)?;
        self.status = KeyStatus::Overlapping;
        self.overlap_ends_at = Some(now + overlap);
        Ok(())
    }

    /// `pending -> active`.
    pub fn promote(&mut self) -> Result<(), KeyError> {
        self.check_transition(KeyStatus::Active)?;
        self.status = KeyStatus::Active;
        Ok(())
    }

    /// `overlapping -> revoked` or `pending -> revoked`.
    pub fn revoke(&mut self, now: DateTime<Utc>) -> Result<(), KeyError> {
        self.check_transition(KeyStatus::Revoked)?;
        self.status = KeyStatus::Revoked;
        self.revoked_at = Some(now);
        Ok(())
    }

    fn check_transition(&self, next: KeyStatus) -> Result<(), KeyError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(KeyError::InvalidTransition {
                label: self.label.to_string(),
                from: self.status,
                to: next,
            })
        }
    }
}

/// Binds a key version's public key to the enclave that generated it.
/// Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Attestation {
    #[schema(value_type = String)]
    pub key_version: KeyLabel,
    /// SHA-256 of the compressed public key, hex.
    pub public_key_hash: String,
    /// Raw quote bytes, hex.
    pub quote: String,
    /// Enclave measurement (MRENCLAVE), hex.
    pub enclave_measurement: String,
    pub timestamp: DateTime<Utc>,
    /// True when produced outside a real enclave.
    #[serde(default)]
    pub simulated: bool,
}

impl Attestation {
    /// SHA-256 over the canonical JSON encoding; this is the value anchored on-chain.
    pub fn digest(&self) -> Result<[u8; 32], KeyError> {
        use sha2::{Digest, Sha256};

        let encoded = serde_json::to_vec(self)
            .map_err(|e| KeyError::Attestation(format!("encode attestation: {e}")))?;
        Ok(Sha256::digest(&encoded).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn labels_order_numerically() {
        let v1 = KeyLabel::bootstrap();
        let v9 = KeyLabel::parse("v9").unwrap();
        let v10 = KeyLabel::parse("v10").unwrap();
        let ts = KeyLabel::from_time(at(1_700_000_000));

        assert!(v1 < v9);
        assert!(v9 < v10);
        assert!(v10 < ts);
        assert_eq!(ts.as_str(), "v1700000000");
    }

    #[test]
    fn next_label_is_strictly_greater() {
        let highest = KeyLabel::bootstrap();
        assert_eq!(KeyLabel::next(at(1), Some(&highest)).as_str(), "v2");

        let later = KeyLabel::next(at(5_000), Some(&highest));
        assert_eq!(later.as_str(), "v5000");

        // Clock behind the highest label still moves forward.
        let ahead = KeyLabel::parse("v9000").unwrap();
        assert_eq!(KeyLabel::next(at(5_000), Some(&ahead)).as_str(), "v9001");
    }

    #[test]
    fn parse_rejects_blank() {
        assert!(KeyLabel::parse("   ").is_err());
        assert_eq!(KeyLabel::parse(" v3 ").unwrap().as_str(), "v3");
    }

    #[test]
    fn lifecycle_transitions() {
        let mut version = KeyVersion::new(KeyLabel::bootstrap(), KeyStatus::Pending, at(0));
        assert!(version.demote(at(0), Duration::days(7)).is_err());

        version.promote().unwrap();
        assert_eq!(version.status, KeyStatus::Active);
        assert!(version.overlap_ends_at.is_none());

        version.demote(at(10), Duration::days(7)).unwrap();
        assert_eq!(version.status, KeyStatus::Overlapping);
        assert_eq!(version.overlap_ends_at, Some(at(10) + Duration::days(7)));

        version.revoke(at(20)).unwrap();
        assert_eq!(version.status, KeyStatus::Revoked);
        assert!(version.promote().is_err());
        assert!(version.revoke(at(30)).is_err());
    }

    #[test]
    fn overlapping_version_expires_at_deadline() {
        let mut version = KeyVersion::new(KeyLabel::bootstrap(), KeyStatus::Active, at(0));
        version.demote(at(100), Duration::seconds(50)).unwrap();

        assert!(version.is_usable_at(at(150)));
        assert_eq!(version.status_at(at(151)), KeyStatus::Revoked);
        assert!(!version.is_usable_at(at(151)));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            KeyStatus::Pending,
            KeyStatus::Active,
            KeyStatus::Overlapping,
            KeyStatus::Revoked,
        ] {
            assert_eq!(status.as_str().parse::<KeyStatus>().unwrap(), status);
        }
        assert!("deprecated".parse::<KeyStatus>().is_err());
    }
}
