// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    anchor::{AnchoredKey, MasterKeyUpdated},
    audit::AuditStatsSnapshot,
    keys::{domain::SigningPurpose, Attestation, KeyStatus},
    models::{
        ActiveKeyResponse, DeriveRequest, DeriveResponse, DomainSignRequest, DomainSignResponse,
        NonceStatusResponse, RotateResponse, SignRequest, SignResponse,
    },
    state::AppState,
};

pub mod admin;
pub mod health;
pub mod keys;
pub mod sign;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/sign", post(sign::sign))
        .route("/sign/domain", post(sign::sign_domain))
        .route("/derive", post(sign::derive))
        .route("/keys/active", get(keys::active_key))
        .route("/keys/{label}/attestation", get(keys::attestation))
        .route("/anchor", get(keys::anchored_key))
        .route("/anchor/events", get(keys::anchor_events))
        .route("/anchor/nonces/{nonce}", get(keys::anchor_nonce));

    let mut app = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .nest("/v1", v1_routes);

    if state.admin.enabled {
        let admin_routes = Router::new()
            .route("/rotate", post(admin::rotate))
            .route("/keys/{label}/confirm-anchor", post(admin::confirm_anchor));
        app = app.nest("/admin", admin_routes);
    }

    app.with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        sign::sign,
        sign::sign_domain,
        sign::derive,
        keys::active_key,
        keys::attestation,
        keys::anchored_key,
        keys::anchor_events,
        keys::anchor_nonce,
        admin::rotate,
        admin::confirm_anchor,
        health::health,
        health::liveness,
        health::readiness
    ),
    components(
        schemas(
            SignRequest,
            SignResponse,
            DomainSignRequest,
            DomainSignResponse,
            SigningPurpose,
            DeriveRequest,
            DeriveResponse,
            ActiveKeyResponse,
            Attestation,
            AnchoredKey,
            MasterKeyUpdated,
            NonceStatusResponse,
            RotateResponse,
            KeyStatus,
            AuditStatsSnapshot,
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse
        )
    ),
    tags(
        (name = "Signing", description = "Raw and domain-separated signatures"),
        (name = "Keys", description = "Key versions, attestations and the on-chain anchor"),
        (name = "Admin", description = "Operator-triggered rotation"),
        (name = "Health", description = "Liveness and readiness probes")
    )
)]
struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{caller_address, AnchorVerifier, KeyUpdate};
    use crate::auth::PeerIdentity;
    use crate::keys::kdf::{derive, MasterSeed};
    use crate::keys::KeyLabel;
    use alloy::primitives::U256;
    use std::sync::Arc;
    use crate::clock::ManualClock;
    use crate::state::testing::{test_state, OPERATOR};
    use crate::state::AdminConfig;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const NOW: i64 = 1_700_000_000;

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value, peer: Option<&str>) -> Request<Body> {
        let mut builder = Request::post(uri).header("content-type", "application/json");
        if let Some(fingerprint) = peer {
            builder = builder.extension(PeerIdentity {
                fingerprint: Some(fingerprint.to_string()),
            });
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let state = test_state(&ManualClock::at_unix(NOW)).await;
        let _ = router(state).into_make_service();
    }

    #[tokio::test]
    async fn sign_returns_signature_and_version() {
        let app = router(test_state(&ManualClock::at_unix(NOW)).await);
        let (status, body) = send(
            app,
            post_json("/v1/sign", json!({ "payload": "ab".repeat(32) }), None),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key_version"], "v1");
        assert_eq!(body["signature"].as_str().unwrap().len(), 128);
    }

    #[tokio::test]
    async fn sign_rejects_bad_input() {
        let state = test_state(&ManualClock::at_unix(NOW)).await;

        let (status, body) = send(
            router(state.clone()),
            post_json("/v1/sign", json!({ "payload": "not-hex" }), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "invalid_argument");

        let (status, body) = send(
            router(state),
            post_json(
                "/v1/sign",
                json!({ "payload": "ab".repeat(32), "key_version": "v42" }),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "invalid_key_version");
    }

    #[tokio::test]
    async fn domain_sign_rejects_expired_request() {
        let app = router(test_state(&ManualClock::at_unix(NOW)).await);
        let request = json!({
            "purpose": "oracle",
            "service_id": "price-feed",
            "chain_id": "1",
            "request_id": "req-1",
            "payload_hash": "11".repeat(32),
            "expiry": NOW - 10
        });
        let (status, body) = send(app, post_json("/v1/sign/domain", request, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "invalid_argument");
    }

    #[tokio::test]
    async fn derive_and_active_key_agree_on_version() {
        let state = test_state(&ManualClock::at_unix(NOW)).await;

        let (status, derived) = send(
            router(state.clone()),
            post_json("/v1/derive", json!({ "domain": "oracle", "path": "feed/1" }), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(derived["public_key"].as_str().unwrap().len(), 66);

        let (status, active) = send(router(state), get("/v1/keys/active")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(active["key_version"], derived["key_version"]);
        assert_eq!(active["usable_versions"], json!(["v1"]));
    }

    #[tokio::test]
    async fn missing_attestation_and_anchor_are_not_found() {
        let state = test_state(&ManualClock::at_unix(NOW)).await;

        let (status, _) = send(router(state.clone()), get("/v1/keys/v1/attestation")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(router(state), get("/v1/anchor")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], "not_found");
    }

    #[tokio::test]
    async fn local_anchor_exposes_events_and_nonces() {
        let state = test_state(&ManualClock::at_unix(NOW)).await;
        let (status, _) = send(router(state.clone()), get("/v1/anchor/events")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let verifier = Arc::new(AnchorVerifier::new());
        let seed = MasterSeed::new(vec![0x21; 32]).unwrap();
        let outgoing = derive(&seed, &KeyLabel::parse("v1").unwrap(), "signing", "").unwrap();
        let incoming = derive(&seed, &KeyLabel::parse("v2").unwrap(), "signing", "").unwrap();
        let caller = caller_address(outgoing.public_key()).unwrap();
        verifier.register(caller, outgoing.public_key()).unwrap();
        let update =
            KeyUpdate::signed_by(&outgoing, incoming.public_key(), [7u8; 32], U256::from(42))
                .unwrap();
        verifier.set_master_key(caller, &update).unwrap();
        let state = state.with_anchor_verifier(verifier);

        let (status, events) = send(router(state.clone()), get("/v1/anchor/events")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(events[0]["nonce"], "42");
        assert_eq!(events[0]["sequence"], 1);

        let (status, used) = send(router(state.clone()), get("/v1/anchor/nonces/42")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(used["used"], true);
        let (_, unused) = send(router(state.clone()), get("/v1/anchor/nonces/43")).await;
        assert_eq!(unused["used"], false);
        let (status, _) = send(router(state), get("/v1/anchor/nonces/0xzz")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_rotate_requires_operator() {
        let state = test_state(&ManualClock::at_unix(NOW)).await;

        let (status, body) =
            send(router(state.clone()), post_json("/admin/rotate", json!({}), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "missing_client_certificate");

        let (status, _) = send(
            router(state.clone()),
            post_json("/admin/rotate", json!({}), Some("stranger")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            router(state.clone()),
            post_json("/admin/rotate", json!({}), Some(OPERATOR)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["old_version"], "v1");
        assert_eq!(body["new_version"], format!("v{NOW}"));
        assert_eq!(body["status"], "active");

        let (_, active) = send(router(state), get("/v1/keys/active")).await;
        assert_eq!(active["key_version"], format!("v{NOW}"));
    }

    #[tokio::test]
    async fn admin_routes_absent_when_disabled() {
        let state = test_state(&ManualClock::at_unix(NOW))
            .await
            .with_admin(AdminConfig::default());
        let (status, _) = send(
            router(state),
            post_json("/admin/rotate", json!({}), Some(OPERATOR)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_active_version() {
        let app = router(test_state(&ManualClock::at_unix(NOW)).await);
        let (status, body) = send(app, get("/health/ready")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["checks"]["active_key_version"], "v1");
        assert_eq!(body["checks"]["audit_sink"], "none");
        assert_eq!(body["checks"]["audit"]["dropped"], 0);
    }

    #[tokio::test]
    async fn responses_carry_request_id() {
        let app = router(test_state(&ManualClock::at_unix(NOW)).await);
        let response = app.oneshot(get("/health/live")).await.unwrap();
        assert!(response.headers().contains_key("x-request-id"));
    }
}
