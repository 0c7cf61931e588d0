// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::audit::AuditStatsSnapshot;
use crate::state::AppState;

/// Health check response with individual component status.
#[derive(Debug, Serialize, ToSchema)]
pub struct ReadyResponse {
    /// Overall health status ("ok", "degraded" or "unavailable").
    pub status: String,
    /// Individual health checks and their results.
    pub checks: HealthChecks,
}

/// Individual health check results.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthChecks {
    /// Whether the service process is running.
    pub service: String,
    /// Active key version, if initialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_key_version: Option<String>,
    /// Key repository backend, if configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_store: Option<String>,
    /// True when running on a fallback or unpersisted keyring.
    pub degraded: bool,
    /// Audit sink backend.
    pub audit_sink: String,
    /// Audit queue counters. A growing `dropped` means lost audit records.
    pub audit: AuditStatsSnapshot,
}

/// Simple health check response for liveness probes.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// Health check endpoint handler.
///
/// Returns 200 when a key version is active (even if degraded), 503 otherwise.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service can sign", body = ReadyResponse),
        (status = 503, description = "Service cannot sign", body = ReadyResponse)
    )
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let keys = state.keys();
    let active = keys.active_version().await.ok();
    let degraded = keys.is_degraded();
    let audit = state.endpoint.audit();

    let status = match (&active, degraded) {
        (None, _) => "unavailable",
        (Some(_), true) => "degraded",
        (Some(_), false) => "ok",
    };
    let response = ReadyResponse {
        status: status.to_string(),
        checks: HealthChecks {
            service: "ok".to_string(),
            active_key_version: active.as_ref().map(ToString::to_string),
            key_store: keys.store_backend().map(str::to_string),
            degraded,
            audit_sink: audit.backend().to_string(),
            audit: audit.stats(),
        },
    };

    let code = if active.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// Liveness probe handler.
///
/// Always returns 200 if the process is running.
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "Health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness probe handler.
///
/// Stricter than `/health`: a degraded replica is reported as not ready so
/// load balancers route around it while its keyring may disagree with peers.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "Health",
    responses(
        (status = 200, description = "Initialized on an authoritative keyring", body = ReadyResponse),
        (status = 503, description = "Not initialized or degraded", body = ReadyResponse)
    )
)]
pub async fn readiness(state: State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let (code, Json(report)) = health(state).await;
    let code = if report.checks.degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        code
    };
    (code, Json(report))
}
