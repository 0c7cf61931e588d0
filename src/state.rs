// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::anchor::AnchorVerifier;
use crate::endpoint::SigningEndpoint;
use crate::keys::KeyManager;

/// Operator interface settings.
#[derive(Debug, Clone, Default)]
pub struct AdminConfig {
    pub enabled: bool,
    /// Client certificate fingerprints allowed to call `/admin`.
    pub identities: HashSet<String>,
}

impl AdminConfig {
    pub fn allows(&self, identity: &str) -> bool {
        self.enabled && self.identities.contains(identity)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub endpoint: SigningEndpoint,
    /// In-process anchor verifier (`ANCHOR_MODE=local`).
    pub anchor: Option<Arc<AnchorVerifier>>,
    pub admin: Arc<AdminConfig>,
    /// Cancelled on process shutdown; bounds admin-triggered store calls.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(endpoint: SigningEndpoint) -> Self {
        Self {
            endpoint,
            anchor: None,
            admin: Arc::new(AdminConfig::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_anchor_verifier(mut self, verifier: Arc<AnchorVerifier>) -> Self {
        self.anchor = Some(verifier);
        self
    }

    pub fn with_admin(mut self, admin: AdminConfig) -> Self {
        self.admin = Arc::new(admin);
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        self.endpoint.keys()
    }
}
