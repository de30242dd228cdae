//! HTTP handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use serde_json::json;
use tracing::{info, warn};

use cronjob_types::TriggerResponse;

use crate::GatewayState;
use crate::auto_trigger::{AutoTriggerQuery, render_script};

/// GET /health: simple HTTP health check.
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /cron/trigger: evaluate the current minute.
///
/// "Already ran this minute" is a normal outcome and still answers 200; only
/// the `success` and `message` fields tell the two apart.
pub async fn trigger(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<TriggerResponse>, StatusCode> {
    if let Some(expected_token) = &state.auth_token {
        match extract_bearer_token(&headers) {
            Some(token) if token == expected_token => {}
            _ => {
                warn!("Cron trigger authentication failed");
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
    }

    let success = state.trigger.trigger_scheduled_tasks().await;
    info!(success, "HTTP cron trigger handled");

    Ok(Json(TriggerResponse::from_outcome(
        success,
        chrono::Utc::now().timestamp(),
    )))
}

/// GET /cron/auto-trigger.js: browser-side poller for `/cron/trigger`.
pub async fn auto_trigger_script(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<AutoTriggerQuery>,
) -> impl IntoResponse {
    let options = query.resolve(state.auto_trigger_interval_ms);
    (
        [
            (header::CONTENT_TYPE, "application/javascript; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        render_script(&options, crate::TRIGGER_PATH),
    )
}

/// Extract bearer token from Authorization header.
pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer my-secret-token".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("my-secret-token"));
    }

    #[test]
    fn test_extract_bearer_token_missing() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn test_extract_bearer_token_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }
}
