// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! PostgREST-backed key version store, shared by replicas.
//!
//! Expected schema:
//!
//! ```sql
//! create table key_versions (
//!   label text primary key,
//!   status text not null,
//!   valid_from timestamptz not null,
//!   overlap_ends_at timestamptz,
//!   revoked_at timestamptz,
//!   created_at timestamptz not null
//! );
//! create unique index key_versions_single_active
//!   on key_versions (status) where status = 'active';
//!
//! create table key_attestations (
//!   key_version text primary key references key_versions(label),
//!   public_key_hash text not null,
//!   quote text not null,
//!   enclave_measurement text not null,
//!   timestamp timestamptz not null,
//!   simulated boolean not null default false
//! );
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;

use super::{update_allowed, KeyVersionStore, StoreError, StoreResult};
use crate::keys::{Attestation, KeyLabel, KeyStatus, KeyVersion};

const KEY_VERSIONS_TABLE: &str = "key_versions";
const ATTESTATIONS_TABLE: &str = "key_attestations";

/// Connection settings for a PostgREST endpoint.
#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    /// REST root, e.g. `https://db.example.com/rest/v1`.
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Thin PostgREST client shared by the key store and the audit backend.
#[derive(Debug, Clone)]
pub struct PostgrestClient {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl PostgrestClient {
    pub fn new(config: &PostgrestConfig) -> StoreResult<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http,
        })
    }

    pub fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}/{}", self.base_url, table))
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder
                .header("apikey", key)
                .header("Authorization", format!("Bearer {key}"));
        }
        builder
    }
}

/// Read the body of a failed response into an error.
pub(crate) async fn error_for(response: Response, what: &str) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{what}: HTTP {status}: {body}");
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(detail),
        StatusCode::CONFLICT => StoreError::Conflict(detail),
        _ => StoreError::Backend(detail),
    }
}

/// Columns written by `update`. `None` fields are written as null.
#[derive(Serialize)]
struct KeyVersionPatch<'a> {
    status: KeyStatus,
    overlap_ends_at: Option<&'a DateTime<Utc>>,
    revoked_at: Option<&'a DateTime<Utc>>,
}

fn update_filter(label: &KeyLabel, expected: KeyStatus) -> [(&'static str, String); 2] {
    [
        ("label", format!("eq.{label}")),
        ("status", format!("eq.{}", expected.as_str())),
    ]
}

pub struct PostgrestKeyVersionStore {
    client: PostgrestClient,
}

impl PostgrestKeyVersionStore {
    pub fn new(config: &PostgrestConfig) -> StoreResult<Self> {
        Ok(Self {
            client: PostgrestClient::new(config)?,
        })
    }

    async fn fetch_versions(&self, query: &[(&str, String)]) -> StoreResult<Vec<KeyVersion>> {
        let response = self
            .client
            .request(Method::GET, KEY_VERSIONS_TABLE)
            .query(query)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for(response, "query key_versions").await);
        }
        let mut versions: Vec<KeyVersion> = response.json().await?;
        versions.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(versions)
    }
}

#[async_trait]
impl KeyVersionStore for PostgrestKeyVersionStore {
    async fn get_active(&self) -> StoreResult<Option<KeyVersion>> {
        let versions = self
            .fetch_versions(&[
                ("status", "eq.active".to_string()),
                ("order", "valid_from.desc".to_string()),
                ("limit", "1".to_string()),
            ])
            .await?;
        Ok(versions.into_iter().next())
    }

    async fn get(&self, label: &KeyLabel) -> StoreResult<Option<KeyVersion>> {
        let versions = self
            .fetch_versions(&[
                ("label", format!("eq.{label}")),
                ("limit", "1".to_string()),
            ])
            .await?;
        Ok(versions.into_iter().next())
    }

    async fn list_by_status(&self, statuses: &[KeyStatus]) -> StoreResult<Vec<KeyVersion>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let list = statuses
            .iter()
            .map(KeyStatus::as_str)
            .collect::<Vec<_>>()
            .join(",");
        self.fetch_versions(&[("status", format!("in.({list})"))])
            .await
    }

    async fn create(&self, version: &KeyVersion) -> StoreResult<()> {
        let response = self
            .client
            .request(Method::POST, KEY_VERSIONS_TABLE)
            .header("Prefer", "return=minimal")
            .json(version)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT if version.status != KeyStatus::Active => {
                Err(StoreError::AlreadyExists(version.label.to_string()))
            }
            _ => Err(error_for(response, "create key_version").await),
        }
    }

    /// `PATCH ... ?label=eq.X&status=eq.<expected>`; an empty result means the
    /// row is gone or another writer moved it first.
    async fn update(&self, version: &KeyVersion, expected: KeyStatus) -> StoreResult<()> {
        if !update_allowed(expected, version.status) {
            return Err(StoreError::Conflict(format!(
                "{} cannot move from {} to {}",
                version.label, expected, version.status
            )));
        }
        let patch = KeyVersionPatch {
            status: version.status,
            overlap_ends_at: version.overlap_ends_at.as_ref(),
            revoked_at: version.revoked_at.as_ref(),
        };
        let response = self
            .client
            .request(Method::PATCH, KEY_VERSIONS_TABLE)
            .query(&update_filter(&version.label, expected))
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for(response, "update key_version").await);
        }
        let updated: Vec<KeyVersion> = response.json().await?;
        if !updated.is_empty() {
            return Ok(());
        }
        match self.get(&version.label).await? {
            None => Err(StoreError::NotFound(version.label.to_string())),
            Some(committed) => Err(StoreError::Conflict(format!(
                "{} is {}, expected {}",
                committed.label, committed.status, expected
            ))),
        }
    }

    async fn put_attestation(&self, attestation: &Attestation) -> StoreResult<()> {
        let response = self
            .client
            .request(Method::POST, ATTESTATIONS_TABLE)
            .header("Prefer", "return=minimal")
            .json(attestation)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(StoreError::AlreadyExists(format!(
                "attestation for {}",
                attestation.key_version
            ))),
            _ => Err(error_for(response, "create key_attestation").await),
        }
    }

    async fn get_attestation(&self, label: &KeyLabel) -> StoreResult<Option<Attestation>> {
        let response = self
            .client
            .request(Method::GET, ATTESTATIONS_TABLE)
            .query(&[
                ("key_version", format!("eq.{label}")),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for(response, "query key_attestations").await);
        }
        let rows: Vec<Attestation> = response.json().await?;
        Ok(rows.into_iter().next())
    }

    fn backend(&self) -> &'static str {
        "postgrest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_writes_explicit_nulls() {
        let version = KeyVersion::new(KeyLabel::bootstrap(), KeyStatus::Active, Utc::now());
        let patch = KeyVersionPatch {
            status: version.status,
            overlap_ends_at: version.overlap_ends_at.as_ref(),
            revoked_at: version.revoked_at.as_ref(),
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["status"], "active");
        assert!(json["overlap_ends_at"].is_null());
        assert!(json.as_object().unwrap().contains_key("revoked_at"));
    }

    #[test]
    fn update_filters_on_expected_status() {
        let filter = update_filter(&KeyLabel::parse("v42").unwrap(), KeyStatus::Overlapping);
        assert_eq!(filter[0], ("label", "eq.v42".to_string()));
        assert_eq!(filter[1], ("status", "eq.overlapping".to_string()));
    }

    #[tokio::test]
    async fn update_rejects_writes_to_revoked_without_a_request() {
        let store = PostgrestKeyVersionStore::new(&PostgrestConfig {
            url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            timeout: Duration::from_millis(50),
        })
        .unwrap();
        let version = KeyVersion::new(KeyLabel::bootstrap(), KeyStatus::Overlapping, Utc::now());
        assert!(matches!(
            store.update(&version, KeyStatus::Revoked).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = PostgrestClient::new(&PostgrestConfig {
            url: "https://db.example.com/rest/v1/".to_string(),
            api_key: Some("anon".to_string()),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let request = client
            .request(Method::GET, KEY_VERSIONS_TABLE)
            .build()
            .unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://db.example.com/rest/v1/key_versions"
        );
        assert_eq!(request.headers()["apikey"], "anon");
    }
}
