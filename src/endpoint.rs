// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Signing Endpoint
//!
//! The transport-independent entry point used by the HTTP handlers. Every
//! call is rate limited by client identity, validated, served by the
//! [`KeyManager`], and recorded in the audit trail. Auditing never gates
//! the result.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audit::{AuditOperation, AuditRecord, AuditSink};
use crate::keys::domain::DomainRequest;
use crate::keys::manager::{DerivedPublicKey, DomainSignature};
use crate::keys::{KeyError, KeyLabel, KeyManager, RotationOutcome, Signature};
use crate::ratelimit::{ClientRateLimiter, RateLimited};

/// Fixed payload width accepted by [`SigningEndpoint::sign`].
pub const PAYLOAD_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl EndpointError {
    /// True for failures caused by the request rather than the service.
    fn is_rejection(&self) -> bool {
        matches!(
            self,
            EndpointError::RateLimited(_)
                | EndpointError::Key(KeyError::InvalidArgument(_))
                | EndpointError::Key(KeyError::InvalidKeyVersion(_))
                | EndpointError::Key(KeyError::RotationPending(_))
        )
    }
}

#[derive(Clone)]
pub struct SigningEndpoint {
    keys: Arc<KeyManager>,
    limiter: Arc<ClientRateLimiter>,
    audit: AuditSink,
}

impl SigningEndpoint {
    pub fn new(keys: Arc<KeyManager>, limiter: Arc<ClientRateLimiter>, audit: AuditSink) -> Self {
        Self {
            keys,
            limiter,
            audit,
        }
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Sign a 32-byte payload hash.
    pub async fn sign(
        &self,
        client: &str,
        payload: &[u8],
        key_version: Option<&str>,
    ) -> Result<Signature, EndpointError> {
        let result = self.sign_inner(client, payload, key_version).await;
        self.record(
            AuditOperation::Sign,
            client,
            result.as_ref().map(|s| &s.key_version),
            key_version,
            &result,
        );
        result
    }

    async fn sign_inner(
        &self,
        client: &str,
        payload: &[u8],
        key_version: Option<&str>,
    ) -> Result<Signature, EndpointError> {
        self.limiter.check(client)?;
        if payload.len() != PAYLOAD_LEN {
            return Err(KeyError::InvalidArgument(format!(
                "payload must be exactly {PAYLOAD_LEN} bytes, got {}",
                payload.len()
            ))
            .into());
        }
        Ok(self.keys.sign(payload, key_version).await?)
    }

    /// Sign a domain-separated request.
    pub async fn sign_domain(
        &self,
        client: &str,
        request: &DomainRequest,
        key_version: Option<&str>,
    ) -> Result<DomainSignature, EndpointError> {
        let result = match self.limiter.check(client) {
            Ok(()) => self
                .keys
                .sign_domain(request, key_version)
                .await
                .map_err(EndpointError::from),
            Err(e) => Err(e.into()),
        };
        self.record(
            AuditOperation::SignDomain,
            client,
            result.as_ref().map(|s| &s.key_version),
            key_version,
            &result,
        );
        result
    }

    /// Public key for `(domain, path)` under the active or requested version.
    pub async fn derive(
        &self,
        client: &str,
        domain: &str,
        path: &str,
        key_version: Option<&str>,
    ) -> Result<DerivedPublicKey, EndpointError> {
        let result = match self.limiter.check(client) {
            Ok(()) => self
                .keys
                .derive(domain, path, key_version)
                .await
                .map_err(EndpointError::from),
            Err(e) => Err(e.into()),
        };
        self.record(
            AuditOperation::Derive,
            client,
            result.as_ref().map(|d| &d.key_version),
            key_version,
            &result,
        );
        result
    }

    /// Operator-triggered rotation.
    pub async fn rotate(
        &self,
        operator: &str,
        cancel: &CancellationToken,
    ) -> Result<RotationOutcome, EndpointError> {
        let result = self.keys.rotate(cancel).await.map_err(EndpointError::from);
        self.record(
            AuditOperation::Rotate,
            operator,
            result.as_ref().map(|o| &o.new_version),
            None,
            &result,
        );
        result
    }

    /// Operator confirmation of an anchored pending version.
    pub async fn confirm_anchor(
        &self,
        operator: &str,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<RotationOutcome, EndpointError> {
        let result = match KeyLabel::parse(label) {
            Ok(label) => self
                .keys
                .confirm_anchor(&label, cancel)
                .await
                .map_err(EndpointError::from),
            Err(e) => Err(e.into()),
        };
        self.record(
            AuditOperation::ConfirmAnchor,
            operator,
            result.as_ref().map(|o| &o.new_version),
            Some(label),
            &result,
        );
        result
    }

    fn record<T>(
        &self,
        operation: AuditOperation,
        client: &str,
        used: Result<&KeyLabel, &EndpointError>,
        requested: Option<&str>,
        result: &Result<T, EndpointError>,
    ) {
        let mut record = AuditRecord::new(operation, client).at(self.keys.now());
        let version = match used {
            Ok(label) => Some(label.to_string()),
            Err(_) => requested
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        };
        if let Some(version) = version {
            record = record.with_key_version(version);
        }
        if let Err(e) = result {
            record = if e.is_rejection() {
                record.rejected(e.to_string())
            } else {
                record.failed(e.to_string())
            };
        }
        self.audit.append(record);
    }
}
