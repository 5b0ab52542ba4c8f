use crate::middleware::{auth_middleware, rate_limit_middleware, AuthConfig, MiddlewareState};
use crate::rate_limit::RateLimiter;
use crate::registry::WorktreeRegistry;
use crate::router::{
    agent_graph, approve_task, comment_on_task, configure_workers, get_snapshot, start_run, start_workers,
    stop_run, stop_workers, submit_follow_up,
};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::middleware as axum_mw;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The main gateway server: one [`WorktreeRegistry`] shared across routes.
pub struct GatewayServer;

impl GatewayServer {
    /// Builds the gateway without auth or rate limiting.
    pub fn build(worktree_root: PathBuf, expansion_interval: Duration) -> Router {
        Self::build_with_middleware(worktree_root, expansion_interval, None, AuthConfig::new(vec![]))
    }

    /// Builds the gateway with optional rate limiting and auth middleware.
    pub fn build_with_middleware(
        worktree_root: PathBuf,
        expansion_interval: Duration,
        rate_limiter: Option<Arc<RateLimiter>>,
        auth_config: AuthConfig,
    ) -> Router {
        let registry = Arc::new(WorktreeRegistry::new(worktree_root, expansion_interval));

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/worktrees/{worktree_id}/snapshot", get(get_snapshot))
            .route("/worktrees/{worktree_id}/agent-graph", get(agent_graph))
            .route("/worktrees/{worktree_id}/runs", post(start_run))
            .route("/worktrees/{worktree_id}/runs/stop", post(stop_run))
            .route("/worktrees/{worktree_id}/follow-up", post(submit_follow_up))
            .route("/worktrees/{worktree_id}/tasks/{task_id}/approve", post(approve_task))
            .route("/worktrees/{worktree_id}/tasks/{task_id}/comments", post(comment_on_task))
            .route("/worktrees/{worktree_id}/workers/configure", post(configure_workers))
            .route("/worktrees/{worktree_id}/workers/start", post(start_workers))
            .route("/worktrees/{worktree_id}/workers/stop", post(stop_workers))
            .route("/worktrees/{worktree_id}/events", get(ws_events_handler))
            .with_state(registry);

        if rate_limiter.is_some() || auth_config.is_enabled() {
            let mw_state = Arc::new(MiddlewareState {
                rate_limiter: rate_limiter.unwrap_or_else(|| Arc::new(RateLimiter::new(1000.0, 1000.0))),
                auth: auth_config,
            });

            app.layer(axum_mw::from_fn_with_state(mw_state.clone(), rate_limit_middleware))
                .layer(axum_mw::from_fn_with_state(mw_state, auth_middleware))
        } else {
            app
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    serde_json::json!({"status": "ok", "service": "pipecraft"}).to_string()
}

/// Upgrades to a WebSocket that streams one worktree's `ProjectionEvent`s
/// as newline-delimited JSON, starting from an initial `snapshot` event.
async fn ws_events_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<WorktreeRegistry>>,
    Path(worktree_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(socket, registry, worktree_id))
}

async fn handle_events_socket(mut socket: WebSocket, registry: Arc<WorktreeRegistry>, worktree_id: String) {
    let controller = match registry.controller(&worktree_id).await {
        Ok(c) => c,
        Err(e) => {
            let _ = socket.send(WsMessage::Text(serde_json::json!({"error": e.to_string()}).to_string().into())).await;
            return;
        }
    };

    let (subscriber_id, mut rx) = match controller.subscribe().await {
        Ok(pair) => pair,
        Err(e) => {
            let _ = socket.send(WsMessage::Text(serde_json::json!({"error": e.to_string()}).to_string().into())).await;
            return;
        }
    };

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if socket.send(WsMessage::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = controller.unsubscribe(subscriber_id).await;
    info!(worktree_id, "event stream subscriber disconnected");
}
