//! cronjob-gateway: HTTP entry points into the trigger engine.
//!
//! Provides:
//! - `POST /cron/trigger` with optional bearer token authentication
//! - `GET /cron/auto-trigger.js` browser poller
//! - `GET /health`
//! - An optional post-request hook that runs a trigger pass after each request

pub mod auto_trigger;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use tracing::{debug, info};

use cronjob_config::GatewayConfig;
use cronjob_core::CronTrigger;

pub const TRIGGER_PATH: &str = "/cron/trigger";
pub const AUTO_TRIGGER_PATH: &str = "/cron/auto-trigger.js";

/// Shared gateway state.
pub struct GatewayState {
    pub trigger: Arc<dyn CronTrigger>,
    pub auth_token: Option<String>,
    pub trigger_on_request: bool,
    pub auto_trigger_interval_ms: u64,
}

impl GatewayState {
    pub fn new(config: &GatewayConfig, trigger: Arc<dyn CronTrigger>) -> Self {
        Self {
            trigger,
            auth_token: config.auth_token.clone(),
            trigger_on_request: config.trigger_on_request,
            auto_trigger_interval_ms: config.auto_trigger_interval_ms,
        }
    }
}

/// Build the router over `state`.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(TRIGGER_PATH, post(handlers::trigger))
        .route(AUTO_TRIGGER_PATH, get(handlers::auto_trigger_script))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            trigger_after_request,
        ))
        .with_state(state)
}

/// Start the Gateway server and serve until Ctrl-C.
pub async fn start_gateway(
    config: &GatewayConfig,
    trigger: Arc<dyn CronTrigger>,
    port_override: Option<u16>,
) -> anyhow::Result<()> {
    let port = port_override.unwrap_or(config.port);
    let state = Arc::new(GatewayState::new(config, trigger));
    let app = router(state);

    let addr: SocketAddr = format!("{}:{port}", config.host).parse()?;
    info!("Gateway listening on {addr}");
    info!("  Trigger:      POST http://{addr}{TRIGGER_PATH}");
    info!("  Auto-trigger: http://{addr}{AUTO_TRIGGER_PATH}");
    info!("  Health:       http://{addr}/health");
    if config.trigger_on_request {
        info!("  Post-request trigger: active");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gateway shutting down");
        })
        .await?;

    Ok(())
}

/// Runs a trigger pass in the background once a request has been answered.
async fn trigger_after_request(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let from_trigger_endpoint = request.uri().path() == TRIGGER_PATH;
    let response = next.run(request).await;

    if state.trigger_on_request && !from_trigger_endpoint && response.status().is_success() {
        let trigger = state.trigger.clone();
        tokio::spawn(async move {
            if trigger.trigger_scheduled_tasks().await {
                info!("Cron tasks triggered after request");
            } else {
                debug!("Post-request cron trigger skipped");
            }
        });
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{StatusCode, header};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use cronjob_types::TriggerResponse;

    /// Answers `true` on the first call of a minute, `false` after.
    #[derive(Default)]
    struct OncePerMinute {
        fired: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CronTrigger for OncePerMinute {
        async fn trigger_scheduled_tasks(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            !self.fired.swap(true, Ordering::SeqCst)
        }
    }

    struct NotifyingTrigger(mpsc::UnboundedSender<()>);

    #[async_trait]
    impl CronTrigger for NotifyingTrigger {
        async fn trigger_scheduled_tasks(&self) -> bool {
            let _ = self.0.send(());
            true
        }
    }

    fn state(trigger: Arc<dyn CronTrigger>, auth_token: Option<&str>) -> Arc<GatewayState> {
        Arc::new(GatewayState {
            trigger,
            auth_token: auth_token.map(String::from),
            trigger_on_request: false,
            auto_trigger_interval_ms: 60_000,
        })
    }

    fn post_trigger(token: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().method("POST").uri(TRIGGER_PATH);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_trigger_reports_ran_then_skipped() {
        let app = router(state(Arc::new(OncePerMinute::default()), None));

        let first = app.clone().oneshot(post_trigger(None)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let body: TriggerResponse = read_json(first).await;
        assert!(body.success);
        assert_eq!(body.message, TriggerResponse::TRIGGERED);
        assert!(body.timestamp > 0);

        let second = app.oneshot(post_trigger(None)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let body: TriggerResponse = read_json(second).await;
        assert!(!body.success);
        assert_eq!(body.message, TriggerResponse::SKIPPED);
    }

    #[tokio::test]
    async fn test_trigger_requires_token_when_configured() {
        let trigger = Arc::new(OncePerMinute::default());
        let app = router(state(trigger.clone(), Some("secret")));

        let denied = app.clone().oneshot(post_trigger(None)).await.unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        let wrong = app.clone().oneshot(post_trigger(Some("nope"))).await.unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);

        let allowed = app.oneshot(post_trigger(Some("secret"))).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_trigger_rejects_get() {
        let app = router(state(Arc::new(OncePerMinute::default()), None));
        let response = app
            .oneshot(axum::http::Request::builder().uri(TRIGGER_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(state(Arc::new(OncePerMinute::default()), None));
        let response = app
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = read_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_auto_trigger_script() {
        let app = router(state(Arc::new(OncePerMinute::default()), None));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/cron/auto-trigger.js?interval=30000&debug=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("application/javascript")
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let script = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(script.contains("var interval = 30000;"));
        assert!(script.contains("var debug = true;"));
        assert!(script.contains("var maxRetries = 3;"));
    }

    #[tokio::test]
    async fn test_auto_trigger_script_carries_token_for_protected_gateway() {
        let app = router(state(Arc::new(OncePerMinute::default()), Some("secret")));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/cron/auto-trigger.js?token=secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let script = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(script.contains(r#"var token = "secret";"#));
        assert!(script.contains("Bearer "));
    }

    #[tokio::test]
    async fn test_post_request_hook_triggers_after_other_requests() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = router(Arc::new(GatewayState {
            trigger: Arc::new(NotifyingTrigger(tx)),
            auth_token: None,
            trigger_on_request: true,
            auto_trigger_interval_ms: 60_000,
        }));

        let response = app
            .clone()
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        // The trigger endpoint runs one pass itself and is not hooked again.
        app.oneshot(post_trigger(None)).await.unwrap();
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_post_request_hook_off_by_default() {
        let trigger = Arc::new(OncePerMinute::default());
        let app = router(state(trigger.clone(), None));
        app.oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
    }
}
