/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

/// Broker-wide error type. Ingress handlers return this; the `IntoResponse`
/// impl maps each variant onto the HTTP surface without leaking internals.
#[derive(Debug, thiserror::Error)]
#[allow(dead_code)]
pub enum BrokerError {
    #[error("config error: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("agent error: {0}")]
    Agent(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unroutable destination: {0}")]
    Unroutable(String),
    #[error("quota exceeded for tenant {0}")]
    QuotaExceeded(i64),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            BrokerError::Validation(m) => (StatusCode::BAD_REQUEST, format!("bad request: {m}")),
            BrokerError::Unauthorized(m) => {
                (StatusCode::UNAUTHORIZED, format!("unauthorized: {m}"))
            }
            BrokerError::Forbidden(m) => (StatusCode::FORBIDDEN, format!("forbidden: {m}")),
            BrokerError::NotFound(m) => (StatusCode::NOT_FOUND, format!("not found: {m}")),
            BrokerError::Store(e) => {
                error!(error = %e, "database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            other => {
                error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, axum::Json(serde_json::json!({ "error": msg }))).into_response()
    }
}
