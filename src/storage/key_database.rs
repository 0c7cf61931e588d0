// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded key version database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `key_versions`: label → serialized KeyVersion
//! - `key_attestations`: label → serialized Attestation
//!
//! The file lives under `/data`, which Gramine mounts as an encrypted
//! filesystem, so lifecycle state cannot be edited from the host.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::{check_single_active, check_update, KeyVersionStore, StoreError, StoreResult};
use crate::keys::{Attestation, KeyLabel, KeyStatus, KeyVersion};

// =============================================================================
// Table Definitions
// =============================================================================

const KEY_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("key_versions");

const KEY_ATTESTATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("key_attestations");

// =============================================================================
// RedbKeyVersionStore
// =============================================================================

pub struct RedbKeyVersionStore {
    db: Arc<Database>,
}

impl RedbKeyVersionStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(KEY_VERSIONS)?;
            let _ = write_txn.open_table(KEY_ATTESTATIONS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Run a blocking database closure off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Backend(format!("database task failed: {e}")))?
    }
}

fn read_all(db: &Database) -> StoreResult<Vec<KeyVersion>> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(KEY_VERSIONS)?;
    let mut versions = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        versions.push(serde_json::from_slice::<KeyVersion>(value.value())?);
    }
    versions.sort_by(|a, b| a.label.cmp(&b.label));
    Ok(versions)
}

/// Insert (`expected == None`) or compare-and-set (`Some(status)`) a version
/// inside one write transaction, enforcing the single-active rule against the
/// committed table.
fn write_version(db: &Database, version: &KeyVersion, expected: Option<KeyStatus>) -> StoreResult<()> {
    let json = serde_json::to_vec(version)?;
    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(KEY_VERSIONS)?;

        let committed: Option<KeyVersion> = match table.get(version.label.as_str())? {
            Some(value) => Some(serde_json::from_slice(value.value())?),
            None => None,
        };
        match (expected, committed) {
            (Some(_), None) => return Err(StoreError::NotFound(version.label.to_string())),
            (None, Some(_)) => return Err(StoreError::AlreadyExists(version.label.to_string())),
            (Some(expected), Some(committed)) => check_update(&committed, version, expected)?,
            (None, None) => {}
        }

        if version.status == KeyStatus::Active {
            let mut existing = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                existing.push(serde_json::from_slice::<KeyVersion>(value.value())?);
            }
            check_single_active(version, existing.iter())?;
        }

        table.insert(version.label.as_str(), json.as_slice())?;
    }
    write_txn.commit()?;
    Ok(())
}

#[async_trait]
impl KeyVersionStore for RedbKeyVersionStore {
    async fn get_active(&self) -> StoreResult<Option<KeyVersion>> {
        self.blocking(|db| {
            Ok(read_all(db)?
                .into_iter()
                .rev()
                .find(|v| v.status == KeyStatus::Active))
        })
        .await
    }

    async fn get(&self, label: &KeyLabel) -> StoreResult<Option<KeyVersion>> {
        let label = label.clone();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(KEY_VERSIONS)?;
            match table.get(label.as_str())? {
                Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_by_status(&self, statuses: &[KeyStatus]) -> StoreResult<Vec<KeyVersion>> {
        let statuses = statuses.to_vec();
        self.blocking(move |db| {
            Ok(read_all(db)?
                .into_iter()
                .filter(|v| statuses.contains(&v.status))
                .collect())
        })
        .await
    }

    async fn create(&self, version: &KeyVersion) -> StoreResult<()> {
        let version = version.clone();
        self.blocking(move |db| write_version(db, &version, None))
            .await
    }

    async fn update(&self, version: &KeyVersion, expected: KeyStatus) -> StoreResult<()> {
        let version = version.clone();
        self.blocking(move |db| write_version(db, &version, Some(expected)))
            .await
    }

    async fn put_attestation(&self, attestation: &Attestation) -> StoreResult<()> {
        let attestation = attestation.clone();
        self.blocking(move |db| {
            let json = serde_json::to_vec(&attestation)?;
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(KEY_ATTESTATIONS)?;
                if table.get(attestation.key_version.as_str())?.is_some() {
                    return Err(StoreError::AlreadyExists(format!(
                        "attestation for {}",
                        attestation.key_version
                    )));
                }
                table.insert(attestation.key_version.as_str(), json.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_attestation(&self, label: &KeyLabel) -> StoreResult<Option<Attestation>> {
        let label = label.clone();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(KEY_ATTESTATIONS)?;
            match table.get(label.as_str())? {
                Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    fn backend(&self) -> &'static str {
        "redb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn open() -> (TempDir, RedbKeyVersionStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbKeyVersionStore::open(&dir.path().join("keys/key_versions.redb")).unwrap();
        (dir, store)
    }

    fn version(label: &str, status: KeyStatus) -> KeyVersion {
        KeyVersion::new(KeyLabel::parse(label).unwrap(), status, Utc::now())
    }

    #[tokio::test]
    async fn create_get_and_update() {
        let (_dir, store) = open();
        let mut v1 = version("v1", KeyStatus::Active);
        store.create(&v1).await.unwrap();

        let active = store.get_active().await.unwrap().unwrap();
        assert_eq!(active.label.as_str(), "v1");

        v1.demote(Utc::now(), chrono::Duration::days(7)).unwrap();
        store.update(&v1, KeyStatus::Active).await.unwrap();
        assert!(store.get_active().await.unwrap().is_none());

        // A writer still expecting `active` lost the race.
        assert!(matches!(
            store.update(&v1, KeyStatus::Active).await,
            Err(StoreError::Conflict(_))
        ));

        let loaded = store.get(&v1.label).await.unwrap().unwrap();
        assert_eq!(loaded.status, KeyStatus::Overlapping);
        assert!(loaded.overlap_ends_at.is_some());
    }

    #[tokio::test]
    async fn enforces_single_active_and_unique_labels() {
        let (_dir, store) = open();
        store.create(&version("v1", KeyStatus::Active)).await.unwrap();

        assert!(matches!(
            store.create(&version("v1", KeyStatus::Pending)).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.create(&version("v2", KeyStatus::Active)).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.update(&version("v9", KeyStatus::Revoked), KeyStatus::Overlapping).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn revoked_versions_stay_revoked() {
        let (_dir, store) = open();
        let mut v1 = version("v1", KeyStatus::Active);
        store.create(&v1).await.unwrap();
        v1.demote(Utc::now(), chrono::Duration::days(7)).unwrap();
        store.update(&v1, KeyStatus::Active).await.unwrap();
        v1.revoke(Utc::now()).unwrap();
        store.update(&v1, KeyStatus::Overlapping).await.unwrap();

        let mut revived = version("v1", KeyStatus::Active);
        revived.demote(Utc::now(), chrono::Duration::days(7)).unwrap();
        assert!(matches!(
            store.update(&revived, KeyStatus::Active).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.update(&revived, KeyStatus::Revoked).await,
            Err(StoreError::Conflict(_))
        ));
        let stored = store.get(&v1.label).await.unwrap().unwrap();
        assert_eq!(stored.status, KeyStatus::Revoked);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key_versions.redb");
        {
            let store = RedbKeyVersionStore::open(&path).unwrap();
            store.create(&version("v10", KeyStatus::Active)).await.unwrap();
            store.create(&version("v9", KeyStatus::Overlapping)).await.unwrap();
        }

        let store = RedbKeyVersionStore::open(&path).unwrap();
        let listed = store
            .list_by_status(&[KeyStatus::Active, KeyStatus::Overlapping])
            .await
            .unwrap();
        let labels: Vec<_> = listed.iter().map(|v| v.label.as_str()).collect();
        assert_eq!(labels, vec!["v9", "v10"]);
    }

    #[tokio::test]
    async fn attestations_are_write_once() {
        let (_dir, store) = open();
        let attestation = Attestation {
            key_version: KeyLabel::bootstrap(),
            public_key_hash: "00".repeat(32),
            quote: "abcd".to_string(),
            enclave_measurement: "11".repeat(32),
            timestamp: Utc::now(),
            simulated: true,
        };
        store.put_attestation(&attestation).await.unwrap();
        assert!(store.put_attestation(&attestation).await.is_err());

        let loaded = store
            .get_attestation(&KeyLabel::bootstrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, attestation);
    }
}
