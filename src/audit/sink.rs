// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Audit Sink
//!
//! Bounded, non-blocking queue in front of an [`AuditBackend`].
//!
//! - `append` uses `try_send`: a full queue drops the record and bumps the
//!   `dropped` counter. Producers never wait on audit storage.
//! - [`AuditWorker`] drains the queue and retries each write with capped
//!   exponential backoff, counting records it gives up on as `failed`.
//! - On shutdown the worker stops accepting records and drains what is
//!   queued, bounded by a deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utoipa::ToSchema;

use super::{AuditBackend, AuditRecord};

/// Retry policy for durable writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[derive(Debug, Default)]
pub struct AuditStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct AuditStatsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub written: u64,
    pub failed: u64,
}

impl AuditStats {
    pub fn snapshot(&self) -> AuditStatsSnapshot {
        AuditStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Producer handle. Cheap to clone.
#[derive(Clone)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditRecord>>,
    stats: Arc<AuditStats>,
    backend: &'static str,
}

impl AuditSink {
    /// A sink and the worker that must be spawned to drain it.
    pub fn new(
        backend: Arc<dyn AuditBackend>,
        capacity: usize,
        policy: BackoffPolicy,
    ) -> (Self, AuditWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(AuditStats::default());
        let sink = Self {
            tx: Some(tx),
            stats: Arc::clone(&stats),
            backend: backend.kind(),
        };
        let worker = AuditWorker {
            rx,
            backend,
            stats,
            policy,
        };
        (sink, worker)
    }

    /// A sink that discards everything (`AUDIT_SINK=none`).
    pub fn disabled() -> Self {
        Self {
            tx: None,
            stats: Arc::new(AuditStats::default()),
            backend: "none",
        }
    }

    /// Enqueue without waiting. Returns false if the record was dropped.
    pub fn append(&self, record: AuditRecord) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(record) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(record)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    operation = ?record.operation,
                    dropped_total = dropped,
                    "Audit queue full, record dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> AuditStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

/// Consumer side of an [`AuditSink`].
pub struct AuditWorker {
    rx: mpsc::Receiver<AuditRecord>,
    backend: Arc<dyn AuditBackend>,
    stats: Arc<AuditStats>,
    policy: BackoffPolicy,
}

impl AuditWorker {
    /// Drain the queue until cancelled, then flush what remains within `drain_deadline`.
    pub async fn run(mut self, shutdown: CancellationToken, drain_deadline: Duration) {
        info!(backend = self.backend.kind(), "Audit worker starting");

        loop {
            tokio::select! {
                record = self.rx.recv() => match record {
                    Some(record) => self.deliver(record).await,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }

        self.rx.close();
        let drained = tokio::time::timeout(drain_deadline, async {
            while let Some(record) = self.rx.recv().await {
                self.deliver(record).await;
            }
        })
        .await;

        if drained.is_err() {
            let mut abandoned = 0u64;
            while self.rx.try_recv().is_ok() {
                abandoned += 1;
            }
            self.stats.failed.fetch_add(abandoned, Ordering::Relaxed);
            warn!(abandoned, "Audit drain deadline reached");
        }
        info!(stats = ?self.stats.snapshot(), "Audit worker stopped");
    }

    async fn deliver(&self, record: AuditRecord) {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.backend.write(&record).await {
                Ok(()) => {
                    self.stats.written.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) if attempt == attempts => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        event_id = %record.event_id,
                        attempts,
                        error = %e,
                        "Audit write failed, giving up"
                    );
                }
                Err(e) => {
                    let delay = self.policy.delay(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Audit write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditError, AuditOperation};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails the first `failures` writes, then records.
    #[derive(Default)]
    struct FlakyBackend {
        failures: AtomicU64,
        written: Mutex<Vec<AuditRecord>>,
    }

    impl FlakyBackend {
        fn failing(n: u64) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU64::new(n),
                written: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AuditBackend for FlakyBackend {
        async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(AuditError::Io(std::io::Error::other("disk unavailable")));
            }
            self.written.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "flaky"
        }
    }

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
            max_attempts,
        }
    }

    fn record() -> AuditRecord {
        AuditRecord::new(AuditOperation::Sign, "client")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            max_attempts: 10,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_secs(1));
        assert_eq!(policy.delay(64), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (sink, _worker) = AuditSink::new(FlakyBackend::failing(0), 2, fast_policy(1));

        assert!(sink.append(record()));
        assert!(sink.append(record()));
        assert!(!sink.append(record()));

        let stats = sink.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn worker_retries_then_writes() {
        let backend = FlakyBackend::failing(2);
        let (sink, worker) = AuditSink::new(backend.clone(), 8, fast_policy(5));
        sink.append(record());

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        worker.run(shutdown, Duration::from_secs(1)).await;

        assert_eq!(sink.stats().written, 1);
        assert_eq!(sink.stats().failed, 0);
        assert_eq!(backend.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn worker_gives_up_after_max_attempts() {
        let backend = FlakyBackend::failing(u64::MAX);
        let (sink, worker) = AuditSink::new(backend, 8, fast_policy(3));
        sink.append(record());

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        worker.run(shutdown, Duration::from_secs(1)).await;

        assert_eq!(sink.stats().failed, 1);
        assert_eq!(sink.stats().written, 0);
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_closes_sink() {
        let backend = FlakyBackend::failing(0);
        let (sink, worker) = AuditSink::new(backend.clone(), 16, fast_policy(1));
        for _ in 0..5 {
            sink.append(record());
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone(), Duration::from_secs(1)));
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(backend.written.lock().unwrap().len(), 5);
        assert!(!sink.append(record()));
        assert_eq!(sink.stats().dropped, 1);
    }

    #[test]
    fn disabled_sink_accepts_nothing() {
        let sink = AuditSink::disabled();
        assert!(!sink.append(record()));
        assert_eq!(sink.backend(), "none");
    }
}
