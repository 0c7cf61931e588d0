// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relational TEE Signer - Enclave Key Lifecycle & Domain-Separated Signing
//!
//! This crate runs inside an Intel SGX enclave (Gramine). It derives
//! versioned signing keys from an injected master seed, rotates them with
//! an overlap window, anchors every new master public key on-chain, and
//! serves signatures to downstream services over mutual TLS.
//!
//! ## Modules
//!
//! - `keys` - KDF, key versions, the key manager and its maintenance task
//! - `storage` - Key version repositories (redb, PostgREST, in-memory)
//! - `anchor` - Trust-anchor message, verifier and submitters
//! - `audit` - Non-blocking audit sink and its durable back-ends
//! - `endpoint` - Rate-limited, audited signing facade
//! - `api` - HTTP API handlers (Axum)
//! - `auth` - Client identity from mTLS certificates
//! - `tls` - Server TLS configuration and peer identity acceptor

pub mod anchor;
pub mod api;
pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod keys;
pub mod models;
pub mod ratelimit;
pub mod state;
pub mod storage;
pub mod tls;
