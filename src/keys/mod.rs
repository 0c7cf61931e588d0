// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Key lifecycle: derivation, versioning, rotation and signing.
//!
//! | Module        | Responsibility                                   |
//! |---------------|--------------------------------------------------|
//! | `kdf`         | HKDF-SHA256 derivation from the master seed      |
//! | `version`     | Key version records and lifecycle transitions    |
//! | `manager`     | In-enclave keyring, rotation and signing         |
//! | `domain`      | Domain-separated message construction            |
//! | `attestation` | SGX quote generation for new public keys         |
//! | `scheduler`   | Background refresh, overlap expiry and rotation  |

pub mod attestation;
pub mod domain;
pub mod kdf;
pub mod manager;
pub mod scheduler;
pub mod version;

pub use attestation::{Attestor, GramineAttestor, SimulatedAttestor};
pub use kdf::{DerivedKey, MasterSeed};
pub use manager::{KeyManager, KeyManagerConfig, RotationOutcome, Signature};
pub use scheduler::KeyMaintenance;
pub use version::{Attestation, KeyLabel, KeyStatus, KeyVersion};

use crate::anchor::AnchorError;

/// Errors surfaced by the key lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid key version: {0}")]
    InvalidKeyVersion(String),

    #[error("key repository unavailable: {0}")]
    Unavailable(String),

    #[error("key manager is not initialized")]
    NotInitialized,

    #[error("rotation to {0} is awaiting anchor confirmation")]
    RotationPending(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid transition for {label}: {from} -> {to}")]
    InvalidTransition {
        label: String,
        from: KeyStatus,
        to: KeyStatus,
    },

    #[error("attestation failed: {0}")]
    Attestation(String),

    #[error("anchor submission failed: {0}")]
    Anchor(#[from] AnchorError),
}
