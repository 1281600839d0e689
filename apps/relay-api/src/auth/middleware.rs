//! Shared-secret gate for the relay WebSocket upgrade.

use std::collections::HashMap;

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::error::ApiError;
use crate::AppState;

/// Marker proving the request carried the configured `AUTH_API_KEY`.
///
/// The key is read from the `Authorization` header, falling back to the
/// `authorization` or `auth` query parameter (browsers cannot set headers on
/// a WebSocket upgrade). With no key configured every request passes.
#[derive(Debug, Clone, Copy)]
pub struct ApiKey;

impl FromRequestParts<AppState> for ApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.auth_api_key.as_deref() else {
            return Ok(ApiKey);
        };

        let provided = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| key_from_query(parts));

        match provided {
            None => Err(ApiError::unauthorized("Authorization header missing")),
            Some(key) if key == expected => Ok(ApiKey),
            Some(_) => {
                tracing::debug!(path = %parts.uri.path(), "rejected upgrade with wrong api key");
                Err(ApiError::unauthorized("Invalid authorization key"))
            }
        }
    }
}

fn key_from_query(parts: &Parts) -> Option<String> {
    let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri).ok()?;
    params
        .remove("authorization")
        .or_else(|| params.remove("auth"))
        .filter(|k| !k.is_empty())
}
