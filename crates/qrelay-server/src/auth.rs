// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bearer API-key authentication.
//!
//! The key is resolved against the store first; on a miss the process-level
//! admin key list is consulted (SHA-256 + constant-time comparison so the
//! check leaks no timing signal).  When no admin keys are configured at all
//! the gateway runs in dev mode and unauthenticated requests pass.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::GatewayError;
use crate::state::Gateway;

/// Request extension carrying the resolved caller identity.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub String);

pub async fn require_api_key(
    State(gw): State<Arc<Gateway>>,
    mut req: Request,
    next: Next,
) -> Response {
    let key = extract_key(req.headers());

    let user = match key {
        Some(key) => match resolve_key(&gw, key).await {
            Some(user) => user,
            None => {
                warn!("request with unknown API key rejected");
                return GatewayError::Unauthorized.into_response();
            }
        },
        None => {
            if gw.admin_keys.is_empty() {
                // Dev mode: no keys configured, requests pass as-is.
                "dev".to_string()
            } else {
                return GatewayError::Unauthorized.into_response();
            }
        }
    };

    req.extensions_mut().insert(AuthedUser(user));
    next.run(req).await
}

async fn resolve_key(gw: &Gateway, key: &str) -> Option<String> {
    match gw.store.lookup_api_key(key).await {
        Ok(Some(user)) => return Some(user),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "API key store lookup failed"),
    }
    if matches_admin_key(&gw.admin_keys, key) {
        return Some("admin".to_string());
    }
    None
}

fn matches_admin_key(admin_keys: &[[u8; 32]], key: &str) -> bool {
    let digest: [u8; 32] = Sha256::digest(key.as_bytes()).into();
    // Scan the whole list unconditionally; each comparison is constant-time.
    let mut matched = false;
    for stored in admin_keys {
        matched |= bool::from(digest.ct_eq(stored));
    }
    matched
}

fn extract_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(auth) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token);
        }
    }
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(key: &str) -> [u8; 32] {
        Sha256::digest(key.as_bytes()).into()
    }

    #[test]
    fn admin_key_matches_by_digest() {
        let keys = vec![digest_of("sk-admin-1"), digest_of("sk-admin-2")];
        assert!(matches_admin_key(&keys, "sk-admin-2"));
        assert!(!matches_admin_key(&keys, "sk-wrong"));
    }

    #[test]
    fn empty_admin_list_matches_nothing() {
        assert!(!matches_admin_key(&[], "anything"));
    }

    #[test]
    fn bearer_header_wins_over_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer from-auth".parse().unwrap(),
        );
        headers.insert("x-api-key", "from-x".parse().unwrap());
        assert_eq!(extract_key(&headers), Some("from-auth"));
    }

    #[test]
    fn x_api_key_used_without_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "from-x".parse().unwrap());
        assert_eq!(extract_key(&headers), Some("from-x"));
    }

    #[test]
    fn non_bearer_authorization_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic dXNlcg==".parse().unwrap(),
        );
        assert_eq!(extract_key(&headers), None);
    }
}
