// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Client identities derived from mutually-authenticated TLS.

use sha2::{Digest, Sha256};

use crate::ratelimit::UNKNOWN_CLIENT;

/// Per-connection identity, attached to every request on that connection
/// by the TLS acceptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Hex SHA-256 of the verified leaf certificate.
    pub fingerprint: Option<String>,
}

impl PeerIdentity {
    pub fn from_certificate(der: &[u8]) -> Self {
        Self {
            fingerprint: Some(certificate_fingerprint(der)),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// The identity rate limiting and auditing are keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: String,
    pub verified: bool,
}

impl ClientIdentity {
    pub fn unknown() -> Self {
        Self {
            id: UNKNOWN_CLIENT.to_string(),
            verified: false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl From<Option<&PeerIdentity>> for ClientIdentity {
    fn from(peer: Option<&PeerIdentity>) -> Self {
        match peer.and_then(|p| p.fingerprint.as_ref()) {
            Some(fingerprint) => Self {
                id: fingerprint.clone(),
                verified: true,
            },
            None => Self::unknown(),
        }
    }
}

pub fn certificate_fingerprint(der: &[u8]) -> String {
    alloy::hex::encode(Sha256::digest(der))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_lowercase_sha256_hex() {
        let fingerprint = certificate_fingerprint(b"certificate");
        assert_eq!(fingerprint.len(), 64);
        assert_eq!(fingerprint, fingerprint.to_lowercase());
    }

    #[test]
    fn missing_peer_is_unknown() {
        let identity = ClientIdentity::from(None);
        assert_eq!(identity.as_str(), "unknown");
        assert!(!identity.verified);

        let anonymous = PeerIdentity::anonymous();
        assert_eq!(ClientIdentity::from(Some(&anonymous)), ClientIdentity::unknown());

        let peer = PeerIdentity::from_certificate(b"leaf");
        let identity = ClientIdentity::from(Some(&peer));
        assert!(identity.verified);
        assert_eq!(identity.id, certificate_fingerprint(b"leaf"));
    }
}
