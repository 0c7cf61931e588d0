// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Manager
//!
//! Owns the in-enclave keyring: which version is active, which are still
//! inside their overlap window, and how to move between them.
//!
//! ## Locking
//!
//! - `ring` (read/write lock) holds the in-memory view. Sign and derive take
//!   the read lock only for the lookup; nothing holds it across I/O.
//! - `lifecycle` (mutex) serializes initialize, rotate, confirm, expiry and
//!   refresh. Store I/O happens under this mutex, and the result is swapped
//!   into `ring` under a short write lock once every write has succeeded.
//!
//! ## Rotation
//!
//! ```text
//! create new (pending) -> demote old (overlapping) -> promote new (active)
//! ```
//!
//! The store rejects a second active version, so the new version is only
//! promoted after the old one has been demoted. With `require_repository`,
//! any failed write aborts the rotation and compensating writes restore the
//! prior store state. Without it the rotation continues in memory and the
//! manager reports itself degraded.
//!
//! When anchoring is required the outgoing key signs a [`KeyUpdate`] for the
//! new key. The new version stays pending (and the old one active) until the
//! anchor confirms.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utoipa::ToSchema;

use super::attestation::{attest_public_key, Attestor};
use super::domain::DomainRequest;
use super::kdf::{self, MasterSeed};
use super::{Attestation, KeyError, KeyLabel, KeyStatus, KeyVersion};
use crate::anchor::{random_nonce, AnchorError, AnchorSubmitter, KeyUpdate};
use crate::clock::{SharedClock, SystemClock};
use crate::storage::{KeyVersionStore, StoreResult};

/// Derivation domain of the per-version root signing key.
pub const SIGNING_DOMAIN: &str = "signing";

const PUBLIC_KEY_CACHE_SIZE: usize = 512;

/// Lifecycle policy.
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    pub rotation_period: Duration,
    pub overlap_period: Duration,
    /// Fail closed when the store is unreachable.
    pub require_repository: bool,
    /// New versions become active only once anchored on-chain.
    pub require_anchor: bool,
    /// Upper bound on any single store call.
    pub store_timeout: std::time::Duration,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            rotation_period: Duration::days(30),
            overlap_period: Duration::days(7),
            require_repository: true,
            require_anchor: false,
            store_timeout: std::time::Duration::from_secs(5),
        }
    }
}

/// A payload signature and the version that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signature: [u8; 64],
    pub key_version: KeyLabel,
}

/// A domain-separated signature.
#[derive(Debug, Clone)]
pub struct DomainSignature {
    pub signature: [u8; 64],
    pub key_version: KeyLabel,
    pub domain_hash: [u8; 32],
    pub signed_at: DateTime<Utc>,
}

/// A derived public key and the version it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedPublicKey {
    pub public_key: Vec<u8>,
    pub key_version: KeyLabel,
}

/// Result of a rotation or anchor confirmation.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RotationOutcome {
    #[schema(value_type = String)]
    pub previous_version: KeyLabel,
    #[schema(value_type = String)]
    pub new_version: KeyLabel,
    /// `active`, or `pending` while awaiting anchor confirmation.
    pub status: KeyStatus,
    pub overlap_ends_at: Option<DateTime<Utc>>,
    pub rotated_at: DateTime<Utc>,
    /// False when the store write was skipped (degraded mode).
    pub persisted: bool,
    pub anchor_tx: Option<String>,
}

/// Point-in-time view for health and admin endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct KeyRingSnapshot {
    #[schema(value_type = Option<String>)]
    pub active: Option<KeyLabel>,
    pub versions: Vec<KeyVersion>,
    pub degraded: bool,
    #[schema(value_type = Option<String>)]
    pub store: Option<&'static str>,
    pub next_rotation_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct KeyRing {
    active: Option<KeyLabel>,
    versions: BTreeMap<KeyLabel, KeyVersion>,
}

impl KeyRing {
    fn from_versions(versions: impl IntoIterator<Item = KeyVersion>) -> Self {
        let versions: BTreeMap<_, _> = versions
            .into_iter()
            .filter(|v| v.status != KeyStatus::Revoked)
            .map(|v| (v.label.clone(), v))
            .collect();
        let active = versions
            .values()
            .rev()
            .find(|v| v.status == KeyStatus::Active)
            .map(|v| v.label.clone());
        Self { active, versions }
    }

    fn bootstrap(now: DateTime<Utc>) -> Self {
        Self::from_versions([KeyVersion::new(
            KeyLabel::bootstrap(),
            KeyStatus::Active,
            now,
        )])
    }

    fn active_version(&self) -> Option<&KeyVersion> {
        self.active.as_ref().and_then(|l| self.versions.get(l))
    }

    fn pending(&self) -> Option<&KeyVersion> {
        self.versions
            .values()
            .find(|v| v.status == KeyStatus::Pending)
    }

    fn highest(&self) -> Option<&KeyLabel> {
        self.versions.keys().next_back()
    }
}

pub struct KeyManager {
    seed: MasterSeed,
    config: KeyManagerConfig,
    clock: SharedClock,
    store: Option<Arc<dyn KeyVersionStore>>,
    attestor: Option<Arc<dyn Attestor>>,
    anchor: Option<Arc<dyn AnchorSubmitter>>,
    ring: RwLock<KeyRing>,
    lifecycle: Mutex<()>,
    degraded: AtomicBool,
    attestations: StdMutex<HashMap<KeyLabel, Attestation>>,
    public_keys: StdMutex<LruCache<(KeyLabel, String, String), Vec<u8>>>,
}

impl KeyManager {
    pub fn new(seed: MasterSeed, config: KeyManagerConfig) -> Self {
        Self {
            seed,
            config,
            clock: Arc::new(SystemClock),
            store: None,
            attestor: None,
            anchor: None,
            ring: RwLock::new(KeyRing::default()),
            lifecycle: Mutex::new(()),
            degraded: AtomicBool::new(false),
            attestations: StdMutex::new(HashMap::new()),
            public_keys: StdMutex::new(LruCache::new(
                NonZeroUsize::new(PUBLIC_KEY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyVersionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_attestor(mut self, attestor: Arc<dyn Attestor>) -> Self {
        self.attestor = Some(attestor);
        self
    }

    pub fn with_anchor(mut self, anchor: Arc<dyn AnchorSubmitter>) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn config(&self) -> &KeyManagerConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// True when running on a fallback or in-memory-only state.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn store_backend(&self) -> Option<&'static str> {
        self.store.as_ref().map(|s| s.backend())
    }

    // =========================================================================
    // Initialization and refresh
    // =========================================================================

    /// Load the keyring from the store.
    ///
    /// - store has an active version: load it with every pending/overlapping one
    /// - store is empty: bootstrap `v<now>` as active
    /// - store has versions but none active (a rotation between demote and
    ///   promote): treated as unreachable, never bootstrapped
    /// - store unreachable: fail if `require_repository`, otherwise fall back
    ///   to `v1` and mark the manager degraded
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<KeyLabel, KeyError> {
        let _lifecycle = self.lifecycle.lock().await;
        let now = self.clock.now();

        let ring = match &self.store {
            None if self.config.require_repository => {
                return Err(KeyError::Unavailable(
                    "no key version repository configured".to_string(),
                ));
            }
            None => {
                info!("No key version repository configured, using bootstrap version v1");
                KeyRing::bootstrap(now)
            }
            Some(store) => match self.load_ring(store.as_ref(), cancel).await {
                Ok(Some(ring)) => ring,
                Ok(None) => self.bootstrap_store(store.as_ref(), cancel, now).await?,
                Err(KeyError::Cancelled) => return Err(KeyError::Cancelled),
                Err(e) if self.config.require_repository => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Key repository unavailable, falling back to v1 (degraded)");
                    self.degraded.store(true, Ordering::SeqCst);
                    KeyRing::bootstrap(now)
                }
            },
        };

        let active = ring.active.clone().ok_or(KeyError::NotInitialized)?;
        *self.ring.write().await = ring;

        info!(
            active = %active,
            store = self.store_backend().unwrap_or("none"),
            degraded = self.is_degraded(),
            "Key manager initialized"
        );
        Ok(active)
    }

    async fn bootstrap_store(
        &self,
        store: &dyn KeyVersionStore,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<KeyRing, KeyError> {
        let version = KeyVersion::new(KeyLabel::from_time(now), KeyStatus::Active, now);
        match self.guarded(cancel, store.create(&version)).await {
            Ok(()) => {
                info!(label = %version.label, "Bootstrapped first key version");
                Ok(KeyRing::from_versions([version]))
            }
            Err(e) if self.must_fail(&e) => Err(e),
            Err(e) => {
                warn!(error = %e, "Could not persist bootstrap version, falling back to v1 (degraded)");
                self.degraded.store(true, Ordering::SeqCst);
                Ok(KeyRing::bootstrap(now))
            }
        }
    }

    async fn load_ring(
        &self,
        store: &dyn KeyVersionStore,
        cancel: &CancellationToken,
    ) -> Result<Option<KeyRing>, KeyError> {
        let active = match self.guarded(cancel, store.get_active()).await? {
            Some(active) => active,
            None => {
                let existing = self
                    .guarded(
                        cancel,
                        store.list_by_status(&[
                            KeyStatus::Pending,
                            KeyStatus::Active,
                            KeyStatus::Overlapping,
                            KeyStatus::Revoked,
                        ]),
                    )
                    .await?;
                if existing.is_empty() {
                    return Ok(None);
                }
                // The rotation may have completed between the two reads.
                match existing
                    .into_iter()
                    .rev()
                    .find(|v| v.status == KeyStatus::Active)
                {
                    Some(active) => active,
                    None => {
                        return Err(KeyError::Unavailable(
                            "repository has no active key version while others exist".to_string(),
                        ));
                    }
                }
            }
        };
        let mut versions = self
            .guarded(
                cancel,
                store.list_by_status(&[
                    KeyStatus::Pending,
                    KeyStatus::Active,
                    KeyStatus::Overlapping,
                ]),
            )
            .await?;
        if !versions.iter().any(|v| v.label == active.label) {
            versions.push(active);
        }
        Ok(Some(KeyRing::from_versions(versions)))
    }

    /// Resync the in-memory view from the store.
    ///
    /// No-op without a store or without a cancellation context. On error the
    /// current view is kept. A store that is behind the in-memory active
    /// version (after a degraded rotation) never rolls it back.
    pub async fn refresh_from_repository(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, KeyError> {
        let (Some(cancel), Some(store)) = (cancel, &self.store) else {
            return Ok(false);
        };
        let _lifecycle = self.lifecycle.lock().await;

        let loaded = match self.load_ring(store.as_ref(), cancel).await {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                return Err(KeyError::Unavailable(
                    "repository has no active key version".to_string(),
                ));
            }
            Err(KeyError::Cancelled) => return Err(KeyError::Cancelled),
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut ring = self.ring.write().await;
        if let (Some(current), Some(incoming)) = (&ring.active, &loaded.active) {
            if incoming < current {
                warn!(
                    current = %current,
                    repository = %incoming,
                    "Repository is behind in-memory active version, keeping local view"
                );
                return Ok(false);
            }
        }
        let changed = ring.active != loaded.active || ring.versions != loaded.versions;
        *ring = loaded;
        drop(ring);

        self.degraded.store(false, Ordering::SeqCst);
        Ok(changed)
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Label of the active version.
    pub async fn active_version(&self) -> Result<KeyLabel, KeyError> {
        self.ring
            .read()
            .await
            .active
            .clone()
            .ok_or(KeyError::NotInitialized)
    }

    pub async fn snapshot(&self) -> KeyRingSnapshot {
        let ring = self.ring.read().await;
        let next_rotation_at = ring
            .active_version()
            .map(|v| v.valid_from + self.config.rotation_period);
        KeyRingSnapshot {
            active: ring.active.clone(),
            versions: ring.versions.values().cloned().collect(),
            degraded: self.is_degraded(),
            store: self.store_backend(),
            next_rotation_at,
        }
    }

    /// Pick the version to sign with: the active one, or a requested one
    /// that is active or still inside its overlap window.
    async fn resolve(&self, requested: Option<&str>) -> Result<KeyLabel, KeyError> {
        let now = self.clock.now();
        let requested = match requested.map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(KeyLabel::parse(raw)?),
        };

        {
            let ring = self.ring.read().await;
            let active = ring.active.clone().ok_or(KeyError::NotInitialized)?;
            let Some(label) = requested.clone() else {
                return Ok(active);
            };
            if let Some(version) = ring.versions.get(&label) {
                return if version.is_usable_at(now) {
                    Ok(label)
                } else {
                    Err(KeyError::InvalidKeyVersion(format!(
                        "{label} is {}",
                        version.status_at(now)
                    )))
                };
            }
        }

        // Unknown locally; another replica may have rotated since the last refresh.
        self.lookup_remote(requested, now).await
    }

    async fn lookup_remote(
        &self,
        label: Option<KeyLabel>,
        now: DateTime<Utc>,
    ) -> Result<KeyLabel, KeyError> {
        let (Some(label), Some(store)) = (label, &self.store) else {
            return Err(KeyError::InvalidKeyVersion("unknown key version".to_string()));
        };
        let token = CancellationToken::new();
        match self.guarded(&token, store.get(&label)).await {
            Ok(Some(version)) if version.is_usable_at(now) => Ok(label),
            Ok(Some(version)) => Err(KeyError::InvalidKeyVersion(format!(
                "{label} is {}",
                version.status_at(now)
            ))),
            Ok(None) => Err(KeyError::InvalidKeyVersion(format!("unknown key version {label}"))),
            Err(e) if self.must_fail(&e) => {
                warn!(label = %label, error = %e, "Key version lookup failed");
                Err(e)
            }
            Err(e) => {
                warn!(label = %label, error = %e, "Key version lookup failed");
                Err(KeyError::InvalidKeyVersion(format!("unknown key version {label}")))
            }
        }
    }

    /// Sign a 32-byte payload hash.
    pub async fn sign(
        &self,
        payload: &[u8],
        requested: Option<&str>,
    ) -> Result<Signature, KeyError> {
        if payload.len() != 32 {
            return Err(KeyError::InvalidArgument(format!(
                "payload must be a 32-byte hash, got {} bytes",
                payload.len()
            )));
        }
        let label = self.resolve(requested).await?;

        let key = kdf::derive(&self.seed, &label, SIGNING_DOMAIN, "")?;
        let signature = key.sign_prehash(payload)?;
        drop(key);

        Ok(Signature {
            signature,
            key_version: label,
        })
    }

    /// Sign a domain-separated request.
    pub async fn sign_domain(
        &self,
        request: &DomainRequest,
        requested: Option<&str>,
    ) -> Result<DomainSignature, KeyError> {
        let now = self.clock.now();
        request.validate(now)?;
        let domain_hash = request.domain_hash();
        let message = super::domain::signing_message(&domain_hash);
        let signed = self.sign(&message, requested).await?;

        Ok(DomainSignature {
            signature: signed.signature,
            key_version: signed.key_version,
            domain_hash,
            signed_at: now,
        })
    }

    /// Public key for `(version, domain, path)`. Only public keys are cached.
    pub async fn derive(
        &self,
        domain: &str,
        path: &str,
        requested: Option<&str>,
    ) -> Result<DerivedPublicKey, KeyError> {
        if domain.trim().is_empty() {
            return Err(KeyError::InvalidArgument("domain is required".to_string()));
        }
        let label = self.resolve(requested).await?;
        let cache_key = (label.clone(), domain.to_string(), path.to_string());

        if let Some(public_key) = self
            .public_keys
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(&cache_key).cloned())
        {
            return Ok(DerivedPublicKey {
                public_key,
                key_version: label,
            });
        }

        let key = kdf::derive(&self.seed, &label, domain, path)?;
        let public_key = key.public_key().to_vec();
        drop(key);

        if let Ok(mut cache) = self.public_keys.lock() {
            cache.put(cache_key, public_key.clone());
        }
        Ok(DerivedPublicKey {
            public_key,
            key_version: label,
        })
    }

    /// Root signing public key of a version (active when `None`).
    pub async fn public_key(&self, requested: Option<&str>) -> Result<DerivedPublicKey, KeyError> {
        self.derive(SIGNING_DOMAIN, "", requested).await
    }

    /// Attestation of a version, from memory or the store.
    pub async fn attestation(&self, label: &KeyLabel) -> Result<Option<Attestation>, KeyError> {
        if let Some(found) = self
            .attestations
            .lock()
            .ok()
            .and_then(|a| a.get(label).cloned())
        {
            return Ok(Some(found));
        }
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let token = CancellationToken::new();
        self.guarded(&token, store.get_attestation(label)).await
    }

    /// Whether the active version has outlived the rotation period.
    pub async fn rotation_due(&self) -> bool {
        let now = self.clock.now();
        let ring = self.ring.read().await;
        if ring.pending().is_some() {
            return false;
        }
        ring.active_version()
            .is_some_and(|v| now >= v.valid_from + self.config.rotation_period)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Rotate to a new key version.
    pub async fn rotate(&self, cancel: &CancellationToken) -> Result<RotationOutcome, KeyError> {
        let _lifecycle = self.lifecycle.lock().await;
        if cancel.is_cancelled() {
            return Err(KeyError::Cancelled);
        }
        let now = self.clock.now();
        self.expire_locked(cancel, now).await?;
        let ring = self.ring.read().await.clone();

        let previous = ring
            .active_version()
            .cloned()
            .ok_or(KeyError::NotInitialized)?;
        if let Some(pending) = ring.pending() {
            return Err(KeyError::RotationPending(pending.label.to_string()));
        }
        let anchor = match (&self.anchor, self.config.require_anchor) {
            (Some(anchor), true) => Some(Arc::clone(anchor)),
            (None, true) => {
                return Err(KeyError::Anchor(AnchorError::Config(
                    "anchoring is required but no submitter is configured".to_string(),
                )));
            }
            (_, false) => None,
        };

        let label = KeyLabel::next(now, ring.highest());
        let public_key = kdf::derive(&self.seed, &label, SIGNING_DOMAIN, "")?
            .public_key()
            .to_vec();
        let attestation = self.attest(&label, &public_key, now).await?;
        let incoming = KeyVersion::new(label.clone(), KeyStatus::Pending, now);

        // 1. Persist the new version as pending.
        let mut persisted = self.store.is_some();
        if let Some(store) = &self.store {
            if let Err(e) = self
                .persist_pending(store.as_ref(), cancel, &incoming, attestation.as_ref())
                .await
            {
                self.revoke_quietly(store.as_ref(), &incoming, now).await;
                if self.must_fail(&e) {
                    warn!(label = %label, error = %e, "Rotation aborted");
                    return Err(e);
                }
                self.note_degraded(&e, "persist pending key version");
                persisted = false;
            }
        }
        if let Some(attestation) = &attestation {
            if let Ok(mut local) = self.attestations.lock() {
                local.insert(label.clone(), attestation.clone());
            }
        }

        // 2. Anchor, signed by the outgoing key.
        let mut anchor_tx = None;
        if let Some(anchor) = anchor {
            let attestation_hash = attestation
                .as_ref()
                .ok_or_else(|| KeyError::Attestation("anchoring requires an attestation".into()))?
                .digest()?;
            let outgoing = kdf::derive(&self.seed, &previous.label, SIGNING_DOMAIN, "")?;
            let update =
                KeyUpdate::signed_by(&outgoing, &public_key, attestation_hash, random_nonce())?;
            drop(outgoing);

            let submitted = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(KeyError::Cancelled),
                result = anchor.submit(&update) => result.map_err(KeyError::from),
            };
            match submitted {
                // The transaction may already be in flight; leave the pending
                // record for an operator to confirm or revoke.
                Err(KeyError::Cancelled) => return Err(KeyError::Cancelled),
                Err(e) => {
                    warn!(label = %label, error = %e, "Anchor submission failed, rotation aborted");
                    if let (true, Some(store)) = (persisted, &self.store) {
                        self.revoke_quietly(store.as_ref(), &incoming, now).await;
                    }
                    return Err(e);
                }
                Ok(receipt) if !receipt.confirmed => {
                    self.ring
                        .write()
                        .await
                        .versions
                        .insert(label.clone(), incoming);
                    info!(
                        label = %label,
                        tx = %receipt.tx_id,
                        "Rotation awaiting anchor confirmation"
                    );
                    return Ok(RotationOutcome {
                        previous_version: previous.label,
                        new_version: label,
                        status: KeyStatus::Pending,
                        overlap_ends_at: None,
                        rotated_at: now,
                        persisted,
                        anchor_tx: Some(receipt.tx_id),
                    });
                }
                Ok(receipt) => anchor_tx = Some(receipt.tx_id),
            }
        }

        // 3. Demote the old version, promote the new one, commit.
        self.promote(cancel, previous, incoming, now, persisted, anchor_tx)
            .await
    }

    /// Promote a pending version once its anchor transaction has confirmed.
    pub async fn confirm_anchor(
        &self,
        label: &KeyLabel,
        cancel: &CancellationToken,
    ) -> Result<RotationOutcome, KeyError> {
        let _lifecycle = self.lifecycle.lock().await;
        let now = self.clock.now();
        let ring = self.ring.read().await.clone();

        let previous = ring
            .active_version()
            .cloned()
            .ok_or(KeyError::NotInitialized)?;
        let incoming = match ring.versions.get(label) {
            Some(v) if v.status == KeyStatus::Pending => v.clone(),
            Some(v) => {
                return Err(KeyError::InvalidKeyVersion(format!(
                    "{label} is {}, not pending",
                    v.status
                )));
            }
            None => return Err(KeyError::InvalidKeyVersion(format!("unknown key version {label}"))),
        };

        let persisted = self.store.is_some() && !self.is_degraded();
        self.promote(cancel, previous, incoming, now, persisted, None)
            .await
    }

    async fn promote(
        &self,
        cancel: &CancellationToken,
        previous: KeyVersion,
        incoming: KeyVersion,
        now: DateTime<Utc>,
        mut persisted: bool,
        anchor_tx: Option<String>,
    ) -> Result<RotationOutcome, KeyError> {
        let mut outgoing = previous.clone();
        outgoing.demote(now, self.config.overlap_period)?;
        let mut promoted = incoming.clone();
        promoted.promote()?;

        if let (true, Some(store)) = (persisted, &self.store) {
            let result = match self
                .guarded(cancel, store.update(&outgoing, KeyStatus::Active))
                .await
            {
                Err(e) => Err(e),
                Ok(()) => match self
                    .guarded(cancel, store.update(&promoted, KeyStatus::Pending))
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.write_quietly(store.as_ref(), &previous, KeyStatus::Overlapping)
                            .await;
                        Err(e)
                    }
                },
            };
            if let Err(e) = result {
                self.revoke_quietly(store.as_ref(), &incoming, now).await;
                if self.must_fail(&e) {
                    warn!(label = %incoming.label, error = %e, "Rotation aborted");
                    return Err(e);
                }
                self.note_degraded(&e, "promote key version");
                persisted = false;
            }
        }

        {
            let mut ring = self.ring.write().await;
            ring.versions.insert(outgoing.label.clone(), outgoing.clone());
            ring.versions.insert(promoted.label.clone(), promoted.clone());
            ring.active = Some(promoted.label.clone());
        }

        info!(
            previous = %outgoing.label,
            active = %promoted.label,
            overlap_ends_at = ?outgoing.overlap_ends_at,
            persisted,
            "Key rotated"
        );
        Ok(RotationOutcome {
            previous_version: outgoing.label,
            new_version: promoted.label,
            status: KeyStatus::Active,
            overlap_ends_at: outgoing.overlap_ends_at,
            rotated_at: now,
            persisted,
            anchor_tx,
        })
    }

    /// Revoke overlapping versions whose window has closed.
    pub async fn expire_overlaps(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<KeyLabel>, KeyError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.expire_locked(cancel, self.clock.now()).await
    }

    /// Caller holds `lifecycle`.
    async fn expire_locked(
        &self,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<Vec<KeyLabel>, KeyError> {
        let expired: Vec<KeyVersion> = {
            let mut ring = self.ring.write().await;
            let mut expired = Vec::new();
            for version in ring.versions.values_mut() {
                if version.status == KeyStatus::Overlapping
                    && version.status_at(now) == KeyStatus::Revoked
                {
                    version.revoke(now)?;
                    expired.push(version.clone());
                }
            }
            ring.versions.retain(|_, v| v.status != KeyStatus::Revoked);
            expired
        };

        for version in &expired {
            if let Some(store) = &self.store {
                if let Err(e) = self
                    .guarded(cancel, store.update(version, KeyStatus::Overlapping))
                    .await
                {
                    warn!(label = %version.label, error = %e, "Failed to persist revoked key version");
                }
            }
            info!(label = %version.label, "Overlap window closed, key version revoked");
        }
        Ok(expired.into_iter().map(|v| v.label).collect())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn attest(
        &self,
        label: &KeyLabel,
        public_key: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<Attestation>, KeyError> {
        let Some(attestor) = &self.attestor else {
            return Ok(None);
        };
        let attestor = Arc::clone(attestor);
        let task_label = label.clone();
        let public_key = public_key.to_vec();
        let result = tokio::task::spawn_blocking(move || {
            attest_public_key(attestor.as_ref(), &task_label, &public_key, now)
        })
        .await
        .map_err(|e| KeyError::Attestation(format!("attestation task failed: {e}")))?;

        match result {
            Ok(attestation) => Ok(Some(attestation)),
            Err(e) if self.config.require_anchor => Err(e),
            Err(e) => {
                warn!(label = %label, error = %e, "Attestation failed, continuing without");
                Ok(None)
            }
        }
    }

    async fn persist_pending(
        &self,
        store: &dyn KeyVersionStore,
        cancel: &CancellationToken,
        version: &KeyVersion,
        attestation: Option<&Attestation>,
    ) -> Result<(), KeyError> {
        self.guarded(cancel, store.create(version)).await?;
        if let Some(attestation) = attestation {
            self.guarded(cancel, store.put_attestation(attestation))
                .await?;
        }
        Ok(())
    }

    /// Best-effort revoke of an aborted pending version.
    async fn revoke_quietly(
        &self,
        store: &dyn KeyVersionStore,
        pending: &KeyVersion,
        now: DateTime<Utc>,
    ) {
        let mut revoked = pending.clone();
        if revoked.revoke(now).is_ok() {
            self.write_quietly(store, &revoked, KeyStatus::Pending).await;
        }
    }

    /// Best-effort compensating write; never cancelled by the caller's token.
    async fn write_quietly(
        &self,
        store: &dyn KeyVersionStore,
        version: &KeyVersion,
        expected: KeyStatus,
    ) {
        let token = CancellationToken::new();
        if let Err(e) = self.guarded(&token, store.update(version, expected)).await {
            warn!(label = %version.label, error = %e, "Compensating store write failed");
        }
    }

    /// Run a store call under the caller's cancellation token and the store timeout.
    async fn guarded<T, F>(&self, cancel: &CancellationToken, op: F) -> Result<T, KeyError>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let timeout = self.config.store_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KeyError::Cancelled),
            result = tokio::time::timeout(timeout, op) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(KeyError::Unavailable(e.to_string())),
                Err(_) => Err(KeyError::Unavailable(format!(
                    "store call timed out after {timeout:?}"
                ))),
            },
        }
    }

    fn must_fail(&self, error: &KeyError) -> bool {
        matches!(error, KeyError::Cancelled) || self.config.require_repository
    }

    fn note_degraded(&self, error: &KeyError, action: &str) {
        warn!(error = %error, action, "Key repository write failed, continuing in memory only");
        self.degraded.store(true, Ordering::SeqCst);
    }
}
