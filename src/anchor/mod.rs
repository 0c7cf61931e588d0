// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! On-chain trust anchor for the enclave master public key.
//!
//! Every rotation produces a [`KeyUpdate`] signed by the outgoing key. The
//! [`AnchorVerifier`] accepts it only if the nonce is fresh and the signature
//! verifies against the key currently registered for the caller. The EVM
//! deployment runs the same checks in the `TrustAnchor` contract.

pub mod message;
pub mod submitter;
pub mod verifier;

pub use message::{caller_address, random_nonce, KeyUpdate};
pub use submitter::{AnchorReceipt, AnchorSubmitter, EvmAnchorSubmitter, LocalAnchorSubmitter};
pub use verifier::{AnchorVerifier, AnchoredKey, MasterKeyUpdated};

use alloy::primitives::{Address, U256};

#[derive(Debug, thiserror::Error)]
pub enum AnchorError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("nonce {0} has already been used")]
    NonceReused(U256),

    #[error("caller {0} has no registered key")]
    UnknownCaller(Address),

    #[error("signature does not verify against the registered key")]
    BadSignature,

    #[error("caller {0} is already registered")]
    AlreadyRegistered(Address),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("anchor transaction failed: {0}")]
    Submission(String),

    #[error("anchor transaction reverted: {0}")]
    Rejected(String),

    #[error("anchor configuration error: {0}")]
    Config(String),
}
