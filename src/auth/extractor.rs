// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Axum extractors for client identity.
//!
//! ```rust,ignore
//! async fn sign(Client(client): Client, State(state): State<AppState>) -> ... {
//!     // client.id is the certificate fingerprint, or "unknown"
//! }
//! ```

use std::convert::Infallible;

use axum::{extract::FromRequestParts, http::request::Parts};

use super::{AuthError, ClientIdentity, PeerIdentity};
use crate::state::AppState;

/// Caller identity. Never rejects: callers without a certificate are `unknown`.
pub struct Client(pub ClientIdentity);

impl<S> FromRequestParts<S> for Client
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Client(ClientIdentity::from(
            parts.extensions.get::<PeerIdentity>(),
        )))
    }
}

/// Extractor that requires an allowlisted operator certificate.
pub struct Operator(pub ClientIdentity);

impl FromRequestParts<AppState> for Operator {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let identity = ClientIdentity::from(parts.extensions.get::<PeerIdentity>());
        if !identity.verified {
            return Err(AuthError::MissingClientCertificate);
        }
        if !state.admin.allows(identity.as_str()) {
            tracing::warn!(client = %identity.id, "Operator request refused");
            return Err(AuthError::Forbidden);
        }
        Ok(Operator(identity))
    }
}
