// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Client Authentication
//!
//! Callers authenticate with mutual TLS. The server verifies the client
//! certificate against the configured CA, and the SHA-256 fingerprint of
//! the leaf certificate becomes the caller's identity.
//!
//! ## Flow
//!
//! 1. TLS handshake verifies the client certificate chain
//! 2. The acceptor attaches a [`PeerIdentity`] to every request on the connection
//! 3. Handlers read it through the [`Client`] or [`Operator`] extractors
//!
//! ## Security
//!
//! - Rate limiting and audit records are keyed on the fingerprint
//! - `/admin` requires a verified certificate on the operator allowlist

pub mod error;
pub mod extractor;
pub mod identity;

pub use error::AuthError;
pub use extractor::{Client, Operator};
pub use identity::{certificate_fingerprint, ClientIdentity, PeerIdentity};
