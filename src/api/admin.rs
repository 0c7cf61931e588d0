// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Operator endpoints for out-of-band key rotation.
//!
//! Mounted only when `ADMIN_ENABLED=true`, and every call requires a client
//! certificate on the operator allowlist.

use axum::{
    extract::{Path, State},
    Json,
};

use crate::{
    auth::Operator,
    error::ApiError,
    models::RotateResponse,
    state::AppState,
};

#[utoipa::path(
    post,
    path = "/admin/rotate",
    tag = "Admin",
    responses(
        (status = 200, description = "Rotation result", body = RotateResponse),
        (status = 401, description = "No client certificate"),
        (status = 403, description = "Not an operator"),
        (status = 409, description = "A previous rotation is awaiting anchor confirmation"),
        (status = 503, description = "Key repository unavailable; nothing changed")
    )
)]
pub async fn rotate(
    Operator(operator): Operator,
    State(state): State<AppState>,
) -> Result<Json<RotateResponse>, ApiError> {
    tracing::info!(operator = %operator.id, "Operator requested key rotation");
    let outcome = state
        .endpoint
        .rotate(operator.as_str(), &state.shutdown)
        .await?;
    Ok(Json(outcome.into()))
}

#[utoipa::path(
    post,
    path = "/admin/keys/{label}/confirm-anchor",
    tag = "Admin",
    params(("label" = String, Path, description = "Pending key version")),
    responses(
        (status = 200, description = "Pending version promoted to active", body = RotateResponse),
        (status = 400, description = "Version is unknown or not pending"),
        (status = 401, description = "No client certificate"),
        (status = 403, description = "Not an operator")
    )
)]
pub async fn confirm_anchor(
    Operator(operator): Operator,
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> Result<Json<RotateResponse>, ApiError> {
    let outcome = state
        .endpoint
        .confirm_anchor(operator.as_str(), &label, &state.shutdown)
        .await?;
    Ok(Json(outcome.into()))
}
