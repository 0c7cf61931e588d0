// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory key version store with fault injection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{check_single_active, check_update, KeyVersionStore, StoreError, StoreResult};
use crate::keys::{Attestation, KeyLabel, KeyStatus, KeyVersion};

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetActive,
    Get,
    List,
    Create,
    Update,
    PutAttestation,
    GetAttestation,
}

#[derive(Default)]
struct Inner {
    versions: BTreeMap<KeyLabel, KeyVersion>,
    attestations: HashMap<KeyLabel, Attestation>,
    failing: HashSet<StoreOp>,
    fail_everything: bool,
    delay: Option<Duration>,
    calls: Vec<StoreOp>,
}

/// Map-backed store. Used by tests and by single-process simulations.
#[derive(Default)]
pub struct MemoryKeyVersionStore {
    inner: Mutex<Inner>,
}

impl MemoryKeyVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing records.
    pub fn with_versions(versions: impl IntoIterator<Item = KeyVersion>) -> Self {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.lock() {
            for version in versions {
                inner.versions.insert(version.label.clone(), version);
            }
        }
        store
    }

    /// Make `op` fail until [`heal`](Self::heal) is called.
    pub fn fail_on(&self, op: StoreOp) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing.insert(op);
        }
    }

    /// Make every operation fail.
    pub fn fail_all(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_everything = true;
        }
    }

    pub fn heal(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing.clear();
            inner.fail_everything = false;
        }
    }

    /// Delay every operation; lets tests cancel a call mid-flight.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.delay = delay;
        }
    }

    /// Snapshot of a stored record.
    pub fn version(&self, label: &str) -> Option<KeyVersion> {
        let inner = self.inner.lock().ok()?;
        inner
            .versions
            .iter()
            .find(|(k, _)| k.as_str() == label)
            .map(|(_, v)| v.clone())
    }

    /// Every stored record, oldest label first.
    pub fn versions(&self) -> Vec<KeyVersion> {
        self.inner
            .lock()
            .map(|inner| inner.versions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Operations attempted so far, in order.
    pub fn calls(&self) -> Vec<StoreOp> {
        self.inner
            .lock()
            .map(|inner| inner.calls.clone())
            .unwrap_or_default()
    }

    async fn enter(&self, op: StoreOp) -> StoreResult<()> {
        let delay = {
            let mut inner = self.lock()?;
            inner.calls.push(op);
            if inner.fail_everything || inner.failing.contains(&op) {
                return Err(StoreError::Backend(format!("injected failure on {op:?}")));
            }
            inner.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl KeyVersionStore for MemoryKeyVersionStore {
    async fn get_active(&self) -> StoreResult<Option<KeyVersion>> {
        self.enter(StoreOp::GetActive).await?;
        let inner = self.lock()?;
        Ok(inner
            .versions
            .values()
            .rev()
            .find(|v| v.status == KeyStatus::Active)
            .cloned())
    }

    async fn get(&self, label: &KeyLabel) -> StoreResult<Option<KeyVersion>> {
        self.enter(StoreOp::Get).await?;
        Ok(self.lock()?.versions.get(label).cloned())
    }

    async fn list_by_status(&self, statuses: &[KeyStatus]) -> StoreResult<Vec<KeyVersion>> {
        self.enter(StoreOp::List).await?;
        let inner = self.lock()?;
        Ok(inner
            .versions
            .values()
            .filter(|v| statuses.contains(&v.status))
            .cloned()
            .collect())
    }

    async fn create(&self, version: &KeyVersion) -> StoreResult<()> {
        self.enter(StoreOp::Create).await?;
        let mut inner = self.lock()?;
        if inner.versions.contains_key(&version.label) {
            return Err(StoreError::AlreadyExists(version.label.to_string()));
        }
        check_single_active(version, inner.versions.values())?;
        inner.versions.insert(version.label.clone(), version.clone());
        Ok(())
    }

    async fn update(&self, version: &KeyVersion, expected: KeyStatus) -> StoreResult<()> {
        self.enter(StoreOp::Update).await?;
        let mut inner = self.lock()?;
        let committed = inner
            .versions
            .get(&version.label)
            .ok_or_else(|| StoreError::NotFound(version.label.to_string()))?;
        check_update(committed, version, expected)?;
        check_single_active(version, inner.versions.values())?;
        inner.versions.insert(version.label.clone(), version.clone());
        Ok(())
    }

    async fn put_attestation(&self, attestation: &Attestation) -> StoreResult<()> {
        self.enter(StoreOp::PutAttestation).await?;
        let mut inner = self.lock()?;
        if inner.attestations.contains_key(&attestation.key_version) {
            return Err(StoreError::AlreadyExists(format!(
                "attestation for {}",
                attestation.key_version
            )));
        }
        inner
            .attestations
            .insert(attestation.key_version.clone(), attestation.clone());
        Ok(())
    }

    async fn get_attestation(&self, label: &KeyLabel) -> StoreResult<Option<Attestation>> {
        self.enter(StoreOp::GetAttestation).await?;
        Ok(self.lock()?.attestations.get(label).cloned())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
