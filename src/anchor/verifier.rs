// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Anchor verifier: the trust-anchor contract's state machine.
//!
//! `set_master_key` checks, in order:
//!
//! 1. every field is non-empty (`EmptyField`)
//! 2. the nonce has never been accepted (`NonceReused`)
//! 3. the caller has a registered key (`UnknownCaller`)
//! 4. the signature verifies against that key (`BadSignature`)
//!
//! On success the nonce is consumed, the anchored record replaced, the
//! caller's registered key advanced to the new key, and `MasterKeyUpdated`
//! emitted. A failed call changes nothing.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use super::{AnchorError, KeyUpdate};
use crate::keys::kdf::verify_prehash;

/// Currently anchored master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct AnchoredKey {
    /// Compressed public key, hex.
    pub public_key: String,
    pub public_key_hash: String,
    pub attestation_hash: String,
    /// Decimal nonce of the accepting update.
    pub nonce: String,
    /// Caller that submitted the update.
    pub updated_by: String,
    pub sequence: u64,
    pub updated_at: DateTime<Utc>,
}

/// Event emitted on every accepted update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct MasterKeyUpdated {
    pub public_key_hash: String,
    pub attestation_hash: String,
    pub nonce: String,
    pub sequence: u64,
}

#[derive(Default)]
struct VerifierState {
    registered: HashMap<Address, Vec<u8>>,
    used_nonces: HashSet<U256>,
    anchored: Option<AnchoredKey>,
    events: Vec<MasterKeyUpdated>,
}

#[derive(Default)]
pub struct AnchorVerifier {
    state: Mutex<VerifierState>,
}

impl AnchorVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bootstrap registration of a caller's initial key.
    pub fn register(&self, caller: Address, public_key: &[u8]) -> Result<(), AnchorError> {
        if public_key.is_empty() {
            return Err(AnchorError::EmptyField("public_key"));
        }
        let mut state = self.lock()?;
        if state.registered.contains_key(&caller) {
            return Err(AnchorError::AlreadyRegistered(caller));
        }
        state.registered.insert(caller, public_key.to_vec());
        tracing::info!(caller = %caller, "Registered anchor caller");
        Ok(())
    }

    pub fn set_master_key(
        &self,
        caller: Address,
        update: &KeyUpdate,
    ) -> Result<MasterKeyUpdated, AnchorError> {
        for (field, value) in [
            ("public_key", &update.public_key),
            ("public_key_hash", &update.public_key_hash),
            ("attestation_hash", &update.attestation_hash),
            ("signature", &update.signature),
        ] {
            if value.is_empty() {
                return Err(AnchorError::EmptyField(field));
            }
        }

        let mut state = self.lock()?;
        if state.used_nonces.contains(&update.nonce) {
            return Err(AnchorError::NonceReused(update.nonce));
        }
        let registered = state
            .registered
            .get(&caller)
            .ok_or(AnchorError::UnknownCaller(caller))?;
        if !verify_prehash(registered, &update.digest(), &update.signature) {
            return Err(AnchorError::BadSignature);
        }

        let sequence = state.events.len() as u64 + 1;
        let event = MasterKeyUpdated {
            public_key_hash: alloy::hex::encode(&update.public_key_hash),
            attestation_hash: alloy::hex::encode(&update.attestation_hash),
            nonce: update.nonce.to_string(),
            sequence,
        };

        state.used_nonces.insert(update.nonce);
        state.registered.insert(caller, update.public_key.clone());
        state.anchored = Some(AnchoredKey {
            public_key: alloy::hex::encode(&update.public_key),
            public_key_hash: event.public_key_hash.clone(),
            attestation_hash: event.attestation_hash.clone(),
            nonce: event.nonce.clone(),
            updated_by: caller.to_string(),
            sequence,
            updated_at: Utc::now(),
        });
        state.events.push(event.clone());

        tracing::info!(
            caller = %caller,
            sequence,
            public_key_hash = %event.public_key_hash,
            "MasterKeyUpdated"
        );
        Ok(event)
    }

    pub fn master_key(&self) -> Option<AnchoredKey> {
        self.state.lock().ok()?.anchored.clone()
    }

    #[cfg(test)]
    pub(crate) fn registered_key(&self, caller: &Address) -> Option<Vec<u8>> {
        self.state.lock().ok()?.registered.get(caller).cloned()
    }

    pub fn is_nonce_used(&self, nonce: U256) -> bool {
        self.state
            .lock()
            .map(|s| s.used_nonces.contains(&nonce))
            .unwrap_or(false)
    }

    pub fn events(&self) -> Vec<MasterKeyUpdated> {
        self.state
            .lock()
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, VerifierState>, AnchorError> {
        self.state
            .lock()
            .map_err(|_| AnchorError::Submission("verifier state poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::caller_address;
    use crate::keys::kdf::{derive, DerivedKey, MasterSeed};
    use crate::keys::KeyLabel;

    fn key(label: &str) -> DerivedKey {
        let seed = MasterSeed::new(vec![5u8; 32]).unwrap();
        derive(&seed, &KeyLabel::parse(label).unwrap(), "signing", "").unwrap()
    }

    fn setup() -> (AnchorVerifier, Address, DerivedKey) {
        let verifier = AnchorVerifier::new();
        let v1 = key("v1");
        let caller = caller_address(v1.public_key()).unwrap();
        verifier.register(caller, v1.public_key()).unwrap();
        (verifier, caller, v1)
    }

    #[test]
    fn accepts_update_and_advances_registered_key() {
        let (verifier, caller, v1) = setup();
        let v2 = key("v2");
        let update = KeyUpdate::signed_by(&v1, v2.public_key(), [1u8; 32], U256::from(7)).unwrap();

        let event = verifier.set_master_key(caller, &update).unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(event.nonce, "7");
        assert!(verifier.is_nonce_used(U256::from(7)));
        assert_eq!(verifier.registered_key(&caller).unwrap(), v2.public_key());

        let anchored = verifier.master_key().unwrap();
        assert_eq!(anchored.public_key, alloy::hex::encode(v2.public_key()));

        // The next update must now be signed by v2.
        let v3 = key("v3");
        let stale = KeyUpdate::signed_by(&v1, v3.public_key(), [1u8; 32], U256::from(8)).unwrap();
        assert!(matches!(
            verifier.set_master_key(caller, &stale),
            Err(AnchorError::BadSignature)
        ));
        let fresh = KeyUpdate::signed_by(&v2, v3.public_key(), [1u8; 32], U256::from(8)).unwrap();
        assert!(verifier.set_master_key(caller, &fresh).is_ok());
        assert_eq!(verifier.events().len(), 2);
    }

    #[test]
    fn replayed_nonce_is_rejected_without_state_change() {
        let (verifier, caller, v1) = setup();
        let v2 = key("v2");
        let update = KeyUpdate::signed_by(&v1, v2.public_key(), [1u8; 32], U256::from(99)).unwrap();
        verifier.set_master_key(caller, &update).unwrap();
        let before = verifier.master_key();

        let err = verifier.set_master_key(caller, &update).unwrap_err();
        assert!(matches!(err, AnchorError::NonceReused(n) if n == U256::from(99)));
        assert_eq!(verifier.master_key(), before);
        assert_eq!(verifier.events().len(), 1);
    }

    #[test]
    fn checks_run_in_order() {
        let (verifier, caller, v1) = setup();
        let v2 = key("v2");
        let mut update =
            KeyUpdate::signed_by(&v1, v2.public_key(), [1u8; 32], U256::from(1)).unwrap();
        verifier.set_master_key(caller, &update).unwrap();

        // Empty field wins over a reused nonce.
        update.attestation_hash.clear();
        assert!(matches!(
            verifier.set_master_key(caller, &update),
            Err(AnchorError::EmptyField("attestation_hash"))
        ));

        // Reused nonce wins over an unknown caller.
        update.attestation_hash = vec![1u8; 32];
        assert!(matches!(
            verifier.set_master_key(Address::ZERO, &update),
            Err(AnchorError::NonceReused(_))
        ));

        let fresh = KeyUpdate::signed_by(&v2, key("v3").public_key(), [1u8; 32], U256::from(2))
            .unwrap();
        assert!(matches!(
            verifier.set_master_key(Address::ZERO, &fresh),
            Err(AnchorError::UnknownCaller(_))
        ));
    }

    #[test]
    fn tampered_update_fails_signature_check() {
        let (verifier, caller, v1) = setup();
        let mut update =
            KeyUpdate::signed_by(&v1, key("v2").public_key(), [1u8; 32], U256::from(3)).unwrap();
        update.attestation_hash = vec![2u8; 32];

        assert!(matches!(
            verifier.set_master_key(caller, &update),
            Err(AnchorError::BadSignature)
        ));
        assert!(!verifier.is_nonce_used(U256::from(3)));
        assert!(verifier.master_key().is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let (verifier, caller, v1) = setup();
        assert!(matches!(
            verifier.register(caller, v1.public_key()),
            Err(AnchorError::AlreadyRegistered(_))
        ));
    }
}
