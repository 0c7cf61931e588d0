// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Durable audit destinations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Method;
use tokio::io::AsyncWriteExt;

use super::{AuditError, AuditRecord};
use crate::storage::postgrest::error_for;
use crate::storage::{PostgrestClient, PostgrestConfig};

const AUDIT_TABLE: &str = "audit_events";
const EVENTS_FILE: &str = "events.jsonl";

#[async_trait]
pub trait AuditBackend: Send + Sync {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError>;

    fn kind(&self) -> &'static str;
}

/// Appends one JSON object per line to `{dir}/{YYYY-MM-DD}/events.jsonl`.
pub struct JsonlAuditBackend {
    dir: PathBuf,
}

impl JsonlAuditBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn events_file(&self, date: &str) -> PathBuf {
        self.dir.join(date).join(EVENTS_FILE)
    }

    /// Read back the records of one day.
    pub async fn read_events(&self, date: &str) -> Result<Vec<AuditRecord>, AuditError> {
        let path = self.events_file(date);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }

    async fn ensure_parent(path: &Path) -> Result<(), AuditError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditBackend for JsonlAuditBackend {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let date = record.timestamp.format("%Y-%m-%d").to_string();
        let path = self.events_file(&date);
        Self::ensure_parent(&path).await?;

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

/// Inserts rows into the `audit_events` table of a PostgREST endpoint.
///
/// ```sql
/// create table audit_events (
///   event_id text primary key,
///   timestamp timestamptz not null,
///   client_identity text not null,
///   operation text not null,
///   key_version text,
///   outcome text not null,
///   error text
/// );
/// ```
pub struct PostgrestAuditBackend {
    client: PostgrestClient,
}

impl PostgrestAuditBackend {
    pub fn new(config: &PostgrestConfig) -> Result<Self, AuditError> {
        Ok(Self {
            client: PostgrestClient::new(config)?,
        })
    }
}

#[async_trait]
impl AuditBackend for PostgrestAuditBackend {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let response = self
            .client
            .request(Method::POST, AUDIT_TABLE)
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await
            .map_err(crate::storage::StoreError::from)?;
        if !response.status().is_success() {
            return Err(error_for(response, "insert audit_event").await.into());
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "postgrest"
    }
}
