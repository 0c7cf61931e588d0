// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::endpoint::EndpointError;
use crate::keys::KeyError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_code: &'static str,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_argument", message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<KeyError> for ApiError {
    fn from(error: KeyError) -> Self {
        match &error {
            KeyError::InvalidArgument(_) => Self::bad_request(error.to_string()),
            KeyError::InvalidKeyVersion(_) => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_key_version",
                error.to_string(),
            ),
            KeyError::RotationPending(_) => {
                Self::new(StatusCode::CONFLICT, "rotation_pending", error.to_string())
            }
            KeyError::Unavailable(_) | KeyError::NotInitialized | KeyError::Cancelled => {
                Self::unavailable(error.to_string())
            }
            _ => {
                tracing::error!(error = %error, "Key operation failed");
                Self::internal(error.to_string())
            }
        }
    }
}

impl From<EndpointError> for ApiError {
    fn from(error: EndpointError) -> Self {
        match error {
            EndpointError::RateLimited(limited) => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                limited.to_string(),
            ),
            EndpointError::Key(key) => key.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            error_code: self.code,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimited;
    use axum::body::to_bytes;

    #[test]
    fn key_errors_map_to_status_and_code() {
        let cases = [
            (KeyError::InvalidArgument("x".into()), StatusCode::BAD_REQUEST, "invalid_argument"),
            (KeyError::InvalidKeyVersion("v9".into()), StatusCode::BAD_REQUEST, "invalid_key_version"),
            (KeyError::RotationPending("v2".into()), StatusCode::CONFLICT, "rotation_pending"),
            (KeyError::Unavailable("db".into()), StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            (KeyError::NotInitialized, StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            (KeyError::Signing("x".into()), StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        ];
        for (error, status, code) in cases {
            let api = ApiError::from(error);
            assert_eq!(api.status, status);
            assert_eq!(api.code, code);
        }
    }

    #[test]
    fn rate_limit_is_429() {
        let api = ApiError::from(EndpointError::RateLimited(RateLimited {
            client: "c".into(),
            retry_after_ms: 10,
        }));
        assert_eq!(api.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(api.code, "rate_limited");
    }

    #[tokio::test]
    async fn into_response_returns_json_body() {
        let response = ApiError::bad_request("bad data").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert_eq!(body, r#"{"error":"bad data","error_code":"invalid_argument"}"#);
    }
}
