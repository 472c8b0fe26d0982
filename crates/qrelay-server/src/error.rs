// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Client-facing error taxonomy.
//!
//! Every error body carries a Chinese friendly `error` message plus a
//! stable `code` for programmatic handling, and optionally a `hint`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use qrelay_upstream::Classified;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Caller shape is invalid, loop detected, or the upstream judged the
    /// request itself bad.
    #[error("{message}")]
    BadRequest {
        code: String,
        message: String,
        hint: Option<String>,
    },
    #[error("缺少或无效的 API 密钥")]
    Unauthorized,
    /// No eligible account remained after exclusions.
    #[error("当前没有可用的上游账号")]
    NoAccount,
    /// All candidate accounts failed; carries the last classifier code.
    #[error("{message}")]
    Upstream { code: String, message: String },
    #[error("网关内部错误")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn from_translate(err: qrelay_protocol::TranslateError) -> Self {
        Self::BadRequest {
            code: err.code().to_string(),
            message: err.to_string(),
            hint: None,
        }
    }

    pub fn from_request_classified(c: &Classified) -> Self {
        Self::BadRequest {
            code: c.code.to_string(),
            message: c.message.to_string(),
            hint: Some(c.hint.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::BadRequest { code, .. } | Self::Upstream { code, .. } => code,
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NoAccount => "ACCOUNT_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NoAccount => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let hint = match &self {
            Self::BadRequest { hint, .. } => hint.clone(),
            _ => None,
        };
        let mut body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        if let Some(hint) = hint {
            body["hint"] = json!(hint);
        }
        (self.status(), Json(body)).into_response()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
