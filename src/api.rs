//! HTTP surface: the `/ws` client stream plus the read-mostly catalog
//! routes, served from one listener.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{HeaderName, HeaderValue};
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::Config;
use crate::container::ContainerRuntime;
use crate::gateway;
use crate::kube;
use crate::ssh::{SshRegistry, TransportPool};
use crate::store::{ImageStore, SshParamsStore};
use crate::term::TermRegistry;

/// Everything the handlers need, explicitly constructed once and cloned
/// into each connection. Registries live here and nowhere else.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub terms: TermRegistry,
    pub ssh: SshRegistry,
    pub runtime: Arc<ContainerRuntime>,
    pub images: ImageStore,
    pub saved: SshParamsStore,
    pub started: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let runtime = Arc::new(ContainerRuntime::new());
        let images = ImageStore::load(config.images_path());
        let saved = SshParamsStore::load(config.ssh_sessions_path(), config.saved_params_max_age);
        let pool = TransportPool::new(
            config.pool_idle_close,
            config.keepalive_interval,
            config.ready_timeout,
        );
        let ssh = SshRegistry::new(pool, saved.clone(), config.default_term.clone());
        let terms = TermRegistry::new(
            runtime.clone(),
            config.kube_inject_delay,
            config.cwd_refresh_delay,
        );
        Self {
            config,
            terms,
            ssh,
            runtime,
            images,
            saved,
            started: Instant::now(),
        }
    }

    /// Graceful shutdown: close every session, then every pooled transport.
    pub async fn shutdown(&self) {
        for info in self.terms.list() {
            self.terms.close(&info.session_id).await;
        }
        for info in self.ssh.list() {
            self.ssh.close(&info.session_id);
        }
        self.ssh.pool().shutdown();
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .route("/api/terminals", get(terminals))
        .route("/api/kubectl-contexts", get(kubectl_contexts))
        .route(
            "/api/container-images",
            get(images_list).post(images_add),
        )
        .route("/api/container-images/{*image}", delete(images_remove))
        .route("/api/ssh-sessions", get(ssh_sessions))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "terminals": state.terms.len(),
        "uptime": state.started.elapsed().as_secs(),
    }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| gateway::handle_socket(socket, state))
}

async fn terminals(State(state): State<AppState>) -> Json<Vec<crate::term::TermSessionInfo>> {
    Json(state.terms.list())
}

async fn kubectl_contexts() -> Json<serde_json::Value> {
    Json(json!({ "contexts": kube::list_contexts().await }))
}

async fn images_list(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "images": state.images.list() }))
}

#[derive(Deserialize)]
struct AddImage {
    image: String,
}

async fn images_add(
    State(state): State<AppState>,
    Json(body): Json<AddImage>,
) -> Json<serde_json::Value> {
    Json(json!({ "images": state.images.insert(&body.image) }))
}

async fn images_remove(
    State(state): State<AppState>,
    Path(image): Path<String>,
) -> Json<serde_json::Value> {
    Json(json!({ "images": state.images.remove(&image) }))
}

async fn ssh_sessions(
    State(state): State<AppState>,
) -> Json<Vec<crate::ssh::registry::SshSessionInfo>> {
    Json(state.ssh.list())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt; // for oneshot()

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        (AppState::new(config), dir)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_status_and_terminal_count() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["terminals"], 0);
        assert!(json["uptime"].is_u64());
    }

    #[tokio::test]
    async fn terminals_listing_starts_empty() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/terminals")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([]));
    }

    #[tokio::test]
    async fn ssh_sessions_listing_starts_empty() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/ssh-sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([]));
    }

    #[tokio::test]
    async fn container_images_crud_round_trip() {
        let (state, _dir) = test_state();
        let app = router(state);

        // Initially empty.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/container-images")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["images"], json!([]));

        // Add two images; newest first.
        for image in ["alpine:latest", "ubuntu:24.04"] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/api/container-images")
                        .header("content-type", "application/json")
                        .body(Body::from(json!({ "image": image }).to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/container-images")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await["images"],
            json!(["ubuntu:24.04", "alpine:latest"])
        );

        // Delete one; image names contain ':' and may contain '/'.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/container-images/alpine:latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["images"], json!(["ubuntu:24.04"]));
    }

    #[tokio::test]
    async fn kubectl_contexts_returns_a_list_either_way() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/kubectl-contexts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["contexts"].is_array());
    }

    #[tokio::test]
    async fn ws_route_exists() {
        let (state, _dir) = test_state();
        let app = router(state);

        // Without an Upgrade header this is not a valid WS handshake, but
        // the route must exist (anything but 404).
        let response = app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/nonexistent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
