// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Public key, attestation and anchor lookups.

use std::sync::Arc;

use alloy::primitives::U256;
use axum::{
    extract::{Path, State},
    Json,
};

use crate::{
    anchor::{AnchorVerifier, AnchoredKey, MasterKeyUpdated},
    error::ApiError,
    keys::{Attestation, KeyLabel},
    models::{ActiveKeyResponse, NonceStatusResponse},
    state::AppState,
};

#[utoipa::path(
    get,
    path = "/v1/keys/active",
    tag = "Keys",
    responses(
        (status = 200, description = "Active version and its root public key", body = ActiveKeyResponse),
        (status = 503, description = "Key manager not initialized")
    )
)]
pub async fn active_key(State(state): State<AppState>) -> Result<Json<ActiveKeyResponse>, ApiError> {
    let keys = state.keys();
    let public = keys.public_key(None).await?;
    let snapshot = keys.snapshot().await;
    Ok(Json(ActiveKeyResponse::new(public, &snapshot, keys.now())))
}

#[utoipa::path(
    get,
    path = "/v1/keys/{label}/attestation",
    tag = "Keys",
    params(("label" = String, Path, description = "Key version label, e.g. v1700000000")),
    responses(
        (status = 200, description = "Attestation binding the version's public key to the enclave", body = Attestation),
        (status = 404, description = "No attestation stored for this version")
    )
)]
pub async fn attestation(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> Result<Json<Attestation>, ApiError> {
    let label = KeyLabel::parse(&label)?;
    state
        .keys()
        .attestation(&label)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no attestation for {label}")))
}

#[utoipa::path(
    get,
    path = "/v1/anchor",
    tag = "Keys",
    responses(
        (status = 200, description = "Currently anchored master key", body = AnchoredKey),
        (status = 404, description = "Nothing anchored yet, or anchoring is not local")
    )
)]
pub async fn anchored_key(State(state): State<AppState>) -> Result<Json<AnchoredKey>, ApiError> {
    state
        .anchor
        .as_ref()
        .and_then(|verifier| verifier.master_key())
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no anchored master key"))
}

fn local_verifier(state: &AppState) -> Result<&Arc<AnchorVerifier>, ApiError> {
    state
        .anchor
        .as_ref()
        .ok_or_else(|| ApiError::not_found("anchoring is not local"))
}

#[utoipa::path(
    get,
    path = "/v1/anchor/events",
    tag = "Keys",
    responses(
        (status = 200, description = "Accepted master key updates, oldest first", body = [MasterKeyUpdated]),
        (status = 404, description = "Anchoring is not local")
    )
)]
pub async fn anchor_events(
    State(state): State<AppState>,
) -> Result<Json<Vec<MasterKeyUpdated>>, ApiError> {
    Ok(Json(local_verifier(&state)?.events()))
}

#[utoipa::path(
    get,
    path = "/v1/anchor/nonces/{nonce}",
    tag = "Keys",
    params(("nonce" = String, Path, description = "Decimal anchor nonce")),
    responses(
        (status = 200, description = "Whether the nonce was consumed", body = NonceStatusResponse),
        (status = 400, description = "Nonce is not a decimal integer"),
        (status = 404, description = "Anchoring is not local")
    )
)]
pub async fn anchor_nonce(
    State(state): State<AppState>,
    Path(nonce): Path<String>,
) -> Result<Json<NonceStatusResponse>, ApiError> {
    let verifier = local_verifier(&state)?;
    let value = U256::from_str_radix(nonce.trim(), 10)
        .map_err(|e| ApiError::bad_request(format!("nonce is not a decimal integer: {e}")))?;
    Ok(Json(NonceStatusResponse {
        nonce: value.to_string(),
        used: verifier.is_nonce_used(value),
    }))
}
