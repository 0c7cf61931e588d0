// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Audit trail for signing, derivation and rotation.
//!
//! Records are appended through [`AuditSink`], which never blocks the caller:
//! when its queue is full the record is dropped and counted. A background
//! worker writes records to an [`AuditBackend`] with capped exponential
//! backoff.

pub mod backend;
pub mod sink;

pub use backend::{AuditBackend, JsonlAuditBackend, PostgrestAuditBackend};
pub use sink::{AuditSink, AuditStats, AuditStatsSnapshot, AuditWorker, BackoffPolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::storage::StoreError;

/// Audited operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Sign,
    SignDomain,
    Derive,
    Rotate,
    ConfirmAnchor,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// Refused before reaching the key manager (rate limit, validation).
    Rejected,
    Failed,
}

/// One audit log entry. Never carries payloads or key material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct AuditRecord {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// Verified client identity (certificate fingerprint) or `unknown`.
    pub client_identity: String,
    pub operation: AuditOperation,
    pub key_version: Option<String>,
    pub outcome: AuditOutcome,
    pub error: Option<String>,
}

impl AuditRecord {
    pub fn new(operation: AuditOperation, client_identity: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            client_identity: client_identity.into(),
            operation,
            key_version: None,
            outcome: AuditOutcome::Success,
            error: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_key_version(mut self, key_version: impl Into<String>) -> Self {
        self.key_version = Some(key_version.into());
        self
    }

    pub fn rejected(mut self, error: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Rejected;
        self.error = Some(error.into());
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Failed;
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("audit store error: {0}")]
    Store(#[from] StoreError),
}
