// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Maintenance
//!
//! Background task that keeps replicas converged and rotates on schedule.
//!
//! Every `interval` (default 60 s):
//! 1. Resync the keyring from the repository.
//! 2. Revoke overlapping versions whose window has closed.
//! 3. Rotate when the active version has outlived the rotation period.
//! 4. Drop idle rate-limiter buckets.
//!
//! Failures are logged and retried on the next tick. Shutdown follows the
//! `CancellationToken` pattern used by every background task in the service.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{KeyError, KeyManager};
use crate::ratelimit::ClientRateLimiter;

/// Default interval between maintenance ticks.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub refreshed: bool,
    pub expired: usize,
    pub rotated_to: Option<String>,
    pub swept_clients: usize,
}

pub struct KeyMaintenance {
    keys: Arc<KeyManager>,
    limiter: Option<Arc<ClientRateLimiter>>,
    interval: Duration,
}

impl KeyMaintenance {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self {
            keys,
            limiter: None,
            interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<ClientRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until the token is cancelled.
    ///
    /// ```rust,ignore
    /// tokio::spawn(maintenance.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Key maintenance starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Key maintenance shutting down");
                    return;
                }
            }

            let report = self.tick(&shutdown).await;
            debug!(?report, "Key maintenance tick");
        }
    }

    /// Execute one maintenance pass.
    pub async fn tick(&self, shutdown: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();

        match self.keys.refresh_from_repository(Some(shutdown)).await {
            Ok(changed) => report.refreshed = changed,
            Err(KeyError::Cancelled) => return report,
            Err(e) => warn!(error = %e, "Key refresh failed, keeping last known keyring"),
        }

        match self.keys.expire_overlaps(shutdown).await {
            Ok(expired) => report.expired = expired.len(),
            Err(e) => warn!(error = %e, "Overlap expiry failed"),
        }

        if self.keys.rotation_due().await {
            match self.keys.rotate(shutdown).await {
                Ok(outcome) => {
                    info!(
                        previous = %outcome.previous_version,
                        new_version = %outcome.new_version,
                        status = %outcome.status,
                        "Scheduled rotation completed"
                    );
                    report.rotated_to = Some(outcome.new_version.to_string());
                }
                Err(KeyError::RotationPending(label)) => {
                    debug!(pending = %label, "Scheduled rotation waiting on anchor confirmation");
                }
                Err(e) => warn!(error = %e, "Scheduled rotation failed"),
            }
        }

        if let Some(limiter) = &self.limiter {
            report.swept_clients = limiter.sweep();
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keys::{KeyManagerConfig, KeyStatus, MasterSeed};
    use crate::ratelimit::RateLimitConfig;
    use crate::storage::MemoryKeyVersionStore;
    use chrono::Duration as ChronoDuration;

    async fn setup(clock: &ManualClock) -> (Arc<KeyManager>, Arc<MemoryKeyVersionStore>) {
        let store = Arc::new(MemoryKeyVersionStore::new());
        let keys = KeyManager::new(
            MasterSeed::new(vec![9u8; 32]).unwrap(),
            KeyManagerConfig::default(),
        )
        .with_clock(Arc::new(clock.clone()))
        .with_store(store.clone());
        keys.initialize(&CancellationToken::new()).await.unwrap();
        (Arc::new(keys), store)
    }

    #[tokio::test]
    async fn tick_rotates_when_due_then_expires_overlap() {
        let clock = ManualClock::at_unix(1_000_000);
        let (keys, store) = setup(&clock).await;
        let first = keys.active_version().await.unwrap();
        let maintenance = KeyMaintenance::new(Arc::clone(&keys));
        let shutdown = CancellationToken::new();

        assert_eq!(maintenance.tick(&shutdown).await.rotated_to, None);

        clock.advance(ChronoDuration::days(30));
        let report = maintenance.tick(&shutdown).await;
        let rotated = report.rotated_to.unwrap();
        assert_eq!(keys.active_version().await.unwrap().as_str(), rotated);

        clock.advance(ChronoDuration::days(8));
        let report = maintenance.tick(&shutdown).await;
        assert_eq!(report.expired, 1);
        assert_eq!(
            store.version(first.as_str()).unwrap().status,
            KeyStatus::Revoked
        );
    }

    #[tokio::test]
    async fn tick_survives_store_outage() {
        let clock = ManualClock::at_unix(1_000_000);
        let (keys, store) = setup(&clock).await;
        let active = keys.active_version().await.unwrap();
        store.fail_all();

        let report = KeyMaintenance::new(Arc::clone(&keys))
            .tick(&CancellationToken::new())
            .await;
        assert!(!report.refreshed);
        assert_eq!(keys.active_version().await.unwrap(), active);
    }

    #[tokio::test]
    async fn tick_sweeps_limiter() {
        let clock = ManualClock::at_unix(1_000_000);
        let (keys, _store) = setup(&clock).await;
        let limiter = Arc::new(
            ClientRateLimiter::new(RateLimitConfig::default()).with_clock(Arc::new(clock.clone())),
        );
        limiter.check("client").unwrap();
        clock.advance(ChronoDuration::hours(1));

        let report = KeyMaintenance::new(keys)
            .with_limiter(limiter)
            .tick(&CancellationToken::new())
            .await;
        assert_eq!(report.swept_clients, 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let clock = ManualClock::at_unix(1_000_000);
        let (keys, _store) = setup(&clock).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            KeyMaintenance::new(keys)
                .with_interval(Duration::from_millis(5))
                .run(shutdown.clone()),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
