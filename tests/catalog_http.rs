//! Catalog HTTP surface against a live listener.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;

use termgate::api::{self, AppState};
use termgate::config::Config;

async fn start_server(dir: &tempfile::TempDir) -> (AppState, SocketAddr) {
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let state = AppState::new(config);
    let app = api::router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (state, addr)
}

#[tokio::test]
async fn health_counts_live_terminals() {
    let dir = tempfile::tempdir().unwrap();
    let (state, addr) = start_server(&dir).await;
    let client = reqwest::Client::new();

    let json: serde_json::Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["terminals"], 0);

    // Create a session directly through the registry and observe the count.
    let (tx, _rx) = tokio::sync::mpsc::channel(16);
    let handle = termgate::gateway::ClientHandle::new(99, tx);
    let session = state.terms.create_local(handle, 80, 24, None, None).unwrap();

    let json: serde_json::Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["terminals"], 1);

    state.terms.close(&session.id).await;
}

#[tokio::test]
async fn terminals_listing_shows_public_fields() {
    let dir = tempfile::tempdir().unwrap();
    let (state, addr) = start_server(&dir).await;
    let client = reqwest::Client::new();

    let (tx, _rx) = tokio::sync::mpsc::channel(16);
    let handle = termgate::gateway::ClientHandle::new(99, tx);
    let session = state
        .terms
        .create_local(handle, 120, 40, Some("catalog test".into()), None)
        .unwrap();

    let json: serde_json::Value = client
        .get(format!("http://{addr}/api/terminals"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let list = json.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["sessionId"], session.id.as_str());
    assert_eq!(list[0]["title"], "catalog test");
    assert_eq!(list[0]["kind"], "local");
    assert_eq!(list[0]["cols"], 120);
    assert_eq!(list[0]["rows"], 40);

    state.terms.close(&session.id).await;
}

#[tokio::test]
async fn container_images_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let client = reqwest::Client::new();

    {
        let (_state, addr) = start_server(&dir).await;
        let response = client
            .post(format!("http://{addr}/api/container-images"))
            .json(&serde_json::json!({"image": "alpine:latest"}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    // A second server over the same data dir sees the remembered image.
    let (_state, addr) = start_server(&dir).await;
    let json: serde_json::Value = client
        .get(format!("http://{addr}/api/container-images"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["images"], serde_json::json!(["alpine:latest"]));
}

#[tokio::test]
async fn container_image_delete_accepts_tags_and_slashes() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, addr) = start_server(&dir).await;
    let client = reqwest::Client::new();

    for image in ["alpine:latest", "ghcr.io/acme/tool:v2"] {
        client
            .post(format!("http://{addr}/api/container-images"))
            .json(&serde_json::json!({"image": image}))
            .send()
            .await
            .unwrap();
    }

    let json: serde_json::Value = client
        .delete(format!("http://{addr}/api/container-images/ghcr.io/acme/tool:v2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["images"], serde_json::json!(["alpine:latest"]));
}

#[tokio::test]
async fn ssh_sessions_listing_is_credential_free() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, addr) = start_server(&dir).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/api/ssh-sessions"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body = response.text().await.unwrap();
    assert_eq!(body.trim(), "[]");
    assert!(!body.contains("password"));
}

#[tokio::test]
async fn kubectl_contexts_degrade_to_empty_list() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, addr) = start_server(&dir).await;
    let client = reqwest::Client::new();

    let json: serde_json::Value = client
        .get(format!("http://{addr}/api/kubectl-contexts"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(json["contexts"].is_array());
}
