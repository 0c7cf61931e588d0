// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Version Store
//!
//! Durable record of key version lifecycle state and attestations. The store
//! never holds key material: every private key is re-derived from the master
//! seed inside the enclave.
//!
//! ## Backends
//!
//! | Backend     | Use                                                     |
//! |-------------|---------------------------------------------------------|
//! | `redb`      | Single instance; file under the Gramine encrypted mount |
//! | `postgrest` | Shared by replicas through a PostgREST endpoint         |
//! | `memory`    | Tests; supports fault injection                         |
//!
//! ## Invariants
//!
//! - At most one version is `active`. Backends reject a write that would
//!   create a second one with [`StoreError::Conflict`].
//! - Labels are unique; `create` on an existing label fails with
//!   [`StoreError::AlreadyExists`].
//! - `update` is a compare-and-set: it applies only while the committed
//!   status equals the caller's `expected` status, and only along a lifecycle
//!   transition (plus the `overlapping -> active` rollback of an aborted
//!   promotion). `revoked` is terminal.
//! - Attestations are write-once.

pub mod key_database;
pub mod memory;
pub mod postgrest;

pub use key_database::RedbKeyVersionStore;
pub use memory::{MemoryKeyVersionStore, StoreOp};
pub use postgrest::{PostgrestClient, PostgrestConfig, PostgrestKeyVersionStore};

use async_trait::async_trait;

use crate::keys::{Attestation, KeyLabel, KeyStatus, KeyVersion};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for key version lifecycle state.
#[async_trait]
pub trait KeyVersionStore: Send + Sync {
    /// The single active version, if any.
    async fn get_active(&self) -> StoreResult<Option<KeyVersion>>;

    /// Point lookup by label.
    async fn get(&self, label: &KeyLabel) -> StoreResult<Option<KeyVersion>>;

    /// All versions whose status is one of `statuses`, oldest label first.
    async fn list_by_status(&self, statuses: &[KeyStatus]) -> StoreResult<Vec<KeyVersion>>;

    /// Insert a new version.
    async fn create(&self, version: &KeyVersion) -> StoreResult<()>;

    /// Replace the lifecycle fields of an existing version whose committed
    /// status is still `expected`. Fails with [`StoreError::Conflict`] when
    /// another writer got there first.
    async fn update(&self, version: &KeyVersion, expected: KeyStatus) -> StoreResult<()>;

    /// Store the attestation for a version.
    async fn put_attestation(&self, attestation: &Attestation) -> StoreResult<()>;

    async fn get_attestation(&self, label: &KeyLabel) -> StoreResult<Option<Attestation>>;

    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

/// Shared checks for backends that see the whole table.
pub(crate) fn check_single_active<'a>(
    candidate: &KeyVersion,
    existing: impl IntoIterator<Item = &'a KeyVersion>,
) -> StoreResult<()> {
    if candidate.status != KeyStatus::Active {
        return Ok(());
    }
    match existing
        .into_iter()
        .find(|v| v.status == KeyStatus::Active && v.label != candidate.label)
    {
        Some(other) => Err(StoreError::Conflict(format!(
            "{} is already active; cannot activate {}",
            other.label, candidate.label
        ))),
        None => Ok(()),
    }
}

/// Whether a write moving a record from `expected` to `next` is allowed.
pub(crate) fn update_allowed(expected: KeyStatus, next: KeyStatus) -> bool {
    expected != KeyStatus::Revoked
        && (expected == next
            || expected.can_transition_to(next)
            || (expected, next) == (KeyStatus::Overlapping, KeyStatus::Active))
}

/// Compare-and-set check of an update against the committed record.
pub(crate) fn check_update(
    committed: &KeyVersion,
    candidate: &KeyVersion,
    expected: KeyStatus,
) -> StoreResult<()> {
    if committed.status != expected {
        return Err(StoreError::Conflict(format!(
            "{} is {}, expected {}",
            committed.label, committed.status, expected
        )));
    }
    if !update_allowed(expected, candidate.status) {
        return Err(StoreError::Conflict(format!(
            "{} cannot move from {} to {}",
            candidate.label, expected, candidate.status
        )));
    }
    Ok(())
}
