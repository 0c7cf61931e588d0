// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Signing and derivation endpoints for downstream services.

use axum::{extract::State, Json};

use crate::{
    auth::Client,
    error::ApiError,
    models::{
        decode_hex, DeriveRequest, DeriveResponse, DomainSignRequest, DomainSignResponse,
        SignRequest, SignResponse,
    },
    state::AppState,
};

#[utoipa::path(
    post,
    path = "/v1/sign",
    tag = "Signing",
    request_body = SignRequest,
    responses(
        (status = 200, description = "Signature and the version that produced it", body = SignResponse),
        (status = 400, description = "Malformed payload or unusable key version"),
        (status = 429, description = "Client over its rate limit"),
        (status = 503, description = "Key repository unavailable")
    )
)]
pub async fn sign(
    Client(client): Client,
    State(state): State<AppState>,
    Json(request): Json<SignRequest>,
) -> Result<Json<SignResponse>, ApiError> {
    let payload = decode_hex("payload", &request.payload)?;
    let signed = state
        .endpoint
        .sign(client.as_str(), &payload, request.key_version.as_deref())
        .await?;
    Ok(Json(signed.into()))
}

#[utoipa::path(
    post,
    path = "/v1/sign/domain",
    tag = "Signing",
    request_body = DomainSignRequest,
    responses(
        (status = 200, description = "Domain-separated signature", body = DomainSignResponse),
        (status = 400, description = "Invalid request fields, expired request or unusable key version"),
        (status = 429, description = "Client over its rate limit"),
        (status = 503, description = "Key repository unavailable")
    )
)]
pub async fn sign_domain(
    Client(client): Client,
    State(state): State<AppState>,
    Json(request): Json<DomainSignRequest>,
) -> Result<Json<DomainSignResponse>, ApiError> {
    let domain_request = request.to_domain_request()?;
    let signed = state
        .endpoint
        .sign_domain(client.as_str(), &domain_request, request.key_version.as_deref())
        .await?;
    Ok(Json(signed.into()))
}

#[utoipa::path(
    post,
    path = "/v1/derive",
    tag = "Signing",
    request_body = DeriveRequest,
    responses(
        (status = 200, description = "Derived public key", body = DeriveResponse),
        (status = 400, description = "Missing domain or unusable key version"),
        (status = 429, description = "Client over its rate limit")
    )
)]
pub async fn derive(
    Client(client): Client,
    State(state): State<AppState>,
    Json(request): Json<DeriveRequest>,
) -> Result<Json<DeriveResponse>, ApiError> {
    let derived = state
        .endpoint
        .derive(
            client.as_str(),
            &request.domain,
            request.path.as_deref().unwrap_or(""),
            request.key_version.as_deref(),
        )
        .await?;
    Ok(Json(derived.into()))
}
