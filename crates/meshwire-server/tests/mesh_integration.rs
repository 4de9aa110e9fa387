#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end coordinator tests over the in-memory store: the HTTP
//! surface, config generation symmetry, pair-port allocation, task
//! lifecycle, and session stream semantics.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::util::ServiceExt;

use meshwire_core::bundle::ConfigBundle;
use meshwire_core::config::ServerConfig;
use meshwire_server::server::{AppState, MeshServer};
use meshwire_server::storage::{
    MemoryStore, NewNode, SqliteStore, Store, TaskFilter, TaskKind, TaskStatus,
};

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.jwt.secret_key = "integration-test-secret".into();
    config
}

/// Coordinator over a fresh in-memory store, plus the state handle the
/// tests poke at directly.
fn test_server() -> (AppState, axum::Router) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let server = MeshServer::new(&test_config(), store);
    let state = server.state().clone();
    (state, server.into_router().unwrap())
}

fn bearer(state: &AppState) -> String {
    format!("Bearer {}", state.jwt.issue(1, "operator").unwrap())
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_node_via_api(
    app: &axum::Router,
    auth: &str,
    name: &str,
    endpoint: &str,
) -> Value {
    let request = Request::builder()
        .method("POST")
        .uri("/api/dashboard/nodes")
        .header(header::AUTHORIZATION, auth)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(format!(
            r#"{{"name":"{name}","endpoint":"{endpoint}"}}"#
        )))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

async fn fetch_agent_config(app: &axum::Router, id: i64, token: &str) -> ConfigBundle {
    let credentials = STANDARD.encode(format!("{id}:{token}"));
    let request = Request::builder()
        .uri(format!("/api/agent/config/{id}"))
        .header(header::AUTHORIZATION, format!("Basic {credentials}"))
        .body(Body::empty())
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// =========================================================================
// Two-node mesh formation
// =========================================================================

#[tokio::test]
async fn two_node_mesh_forms_with_symmetric_ports() {
    let (state, app) = test_server();
    let auth = bearer(&state);

    let a = create_node_via_api(&app, &auth, "edge-a", "1.2.3.4").await;
    let b = create_node_via_api(&app, &auth, "edge-b", "5.6.7.8").await;

    let a_bundle =
        fetch_agent_config(&app, a["id"].as_i64().unwrap(), a["token"].as_str().unwrap()).await;
    let b_bundle =
        fetch_agent_config(&app, b["id"].as_i64().unwrap(), b["token"].as_str().unwrap()).await;

    let a_for_b = &a_bundle.wireguard["edge-b"];
    let b_for_a = &b_bundle.wireguard["edge-a"];

    assert!(a_for_b.contains("ListenPort = 36420"));
    assert!(b_for_a.contains("ListenPort = 36420"));
    assert!(a_for_b.contains("Endpoint = 5.6.7.8:36420"));
    assert!(b_for_a.contains("Endpoint = 1.2.3.4:36420"));
    assert!(a_for_b.contains(&format!(
        "PublicKey = {}",
        b["public_key"].as_str().unwrap()
    )));
    assert!(b_for_a.contains(&format!(
        "PublicKey = {}",
        a["public_key"].as_str().unwrap()
    )));
}

#[tokio::test]
async fn agent_config_requires_the_right_token() {
    let (state, app) = test_server();
    let auth = bearer(&state);
    let a = create_node_via_api(&app, &auth, "edge-a", "1.2.3.4").await;
    let id = a["id"].as_i64().unwrap();

    // Wrong token
    let credentials = STANDARD.encode(format!("{id}:wrong-token"));
    let request = Request::builder()
        .uri(format!("/api/agent/config/{id}"))
        .header(header::AUTHORIZATION, format!("Basic {credentials}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Someone else's id with our token
    let credentials = STANDARD.encode(format!("99:{}", a["token"].as_str().unwrap()));
    let request = Request::builder()
        .uri("/api/agent/config/99")
        .header(header::AUTHORIZATION, format!("Basic {credentials}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// =========================================================================
// Pair-port allocation
// =========================================================================

#[tokio::test]
async fn ports_allocate_monotonically_as_the_fleet_grows() {
    let (state, app) = test_server();
    let auth = bearer(&state);

    let a = create_node_via_api(&app, &auth, "edge-a", "1.1.1.1").await;
    let b = create_node_via_api(&app, &auth, "edge-b", "2.2.2.2").await;
    let a_token = a["token"].as_str().unwrap();
    fetch_agent_config(&app, 1, a_token).await;

    let c = create_node_via_api(&app, &auth, "edge-c", "3.3.3.3").await;
    fetch_agent_config(&app, 1, a_token).await;
    fetch_agent_config(&app, 2, b["token"].as_str().unwrap()).await;
    fetch_agent_config(&app, 3, c["token"].as_str().unwrap()).await;

    let mut ports: Vec<u16> = state
        .store
        .list_pair_ports()
        .await
        .unwrap()
        .iter()
        .map(|p| p.port)
        .collect();
    ports.sort_unstable();
    assert_eq!(ports, vec![36420, 36421, 36422]);

    // Re-rendering changes nothing
    let again = fetch_agent_config(&app, 1, a_token).await;
    assert!(again.wireguard["edge-b"].contains("ListenPort = 36420"));
    assert_eq!(state.store.list_pair_ports().await.unwrap().len(), 3);
}

#[tokio::test]
async fn concurrent_first_allocations_get_distinct_ports() {
    let store = Arc::new(MemoryStore::new());

    let (p1, p2) = tokio::join!(
        store.get_or_create_pair_port(1, 2, 36420),
        store.get_or_create_pair_port(3, 4, 36420),
    );
    let (p1, p2) = (p1.unwrap(), p2.unwrap());

    assert_ne!(p1, p2);
    assert!(p1 >= 36420 && p2 >= 36420);
    assert_eq!(store.list_pair_ports().await.unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_allocation_on_sqlite_backend() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    for name in ["a", "b", "c", "d"] {
        store
            .create_node(NewNode {
                name: name.into(),
                token: format!("token-{name}"),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let (p1, p2) = tokio::join!(
        store.get_or_create_pair_port(1, 2, 36420),
        store.get_or_create_pair_port(3, 4, 36420),
    );
    let (p1, p2) = (p1.unwrap(), p2.unwrap());

    assert_ne!(p1, p2);
    assert_eq!(store.list_pair_ports().await.unwrap().len(), 2);
}

// =========================================================================
// Determinism
// =========================================================================

#[tokio::test]
async fn config_rendering_is_byte_identical_across_fetches() {
    let (state, app) = test_server();
    let auth = bearer(&state);

    let a = create_node_via_api(&app, &auth, "edge-a", "1.1.1.1").await;
    create_node_via_api(&app, &auth, "edge-b", "2.2.2.2").await;
    create_node_via_api(&app, &auth, "edge-c", "3.3.3.3").await;

    let token = a["token"].as_str().unwrap();
    let first = fetch_agent_config(&app, 1, token).await;
    let second = fetch_agent_config(&app, 1, token).await;

    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

// =========================================================================
// Accounts
// =========================================================================

#[tokio::test]
async fn password_flow_register_login_conflict() {
    let (_state, app) = test_server();

    let register = |body: &'static str| {
        let app = app.clone();
        async move {
            app.oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/register")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
        }
    };
    let login = |body: &'static str| {
        let app = app.clone();
        async move {
            app.oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
        }
    };

    let response = register(r#"{"username":"alice","password":"p@ssw0rd!"}"#).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = login(r#"{"username":"alice","password":"p@ssw0rd!"}"#).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["token"].as_str().unwrap().len() > 20);

    let response = login(r#"{"username":"alice","password":"wrong"}"#).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = register(r#"{"username":"alice","password":"p@ssw0rd!"}"#).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn dashboard_requires_a_session_token() {
    let (_state, app) = test_server();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/dashboard/nodes")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// =========================================================================
// Token privacy
// =========================================================================

#[tokio::test]
async fn node_listings_never_reveal_tokens_or_private_keys() {
    let (state, app) = test_server();
    let auth = bearer(&state);

    let created = create_node_via_api(&app, &auth, "edge-a", "1.2.3.4").await;
    let node_token = created["token"].as_str().unwrap().to_string();
    let private_key = state.store.get_node(1).await.unwrap().private_key;

    for uri in ["/api/dashboard/nodes", "/api/dashboard/nodes/1"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .header(header::AUTHORIZATION, auth.as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!text.contains(&node_token), "token leaked via {uri}");
        assert!(!text.contains(&private_key), "private key leaked via {uri}");
    }
}

// =========================================================================
// Tasks
// =========================================================================

#[tokio::test]
async fn config_trigger_persists_a_pending_task() {
    let (state, app) = test_server();
    let auth = bearer(&state);
    create_node_via_api(&app, &auth, "edge-a", "1.2.3.4").await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/dashboard/nodes/config/1")
                .header(header::AUTHORIZATION, auth.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let task_id = body["task_id"].as_str().unwrap();

    let task = state.store.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.node_id, 1);
}

#[tokio::test]
async fn config_trigger_for_unknown_node_is_404() {
    let (state, app) = test_server();
    let auth = bearer(&state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/dashboard/nodes/config/42")
                .header(header::AUTHORIZATION, auth.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn terminal_task_state_is_final() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let server = MeshServer::new(&test_config(), store.clone());
    let state = server.state().clone();

    store
        .create_node(NewNode {
            name: "edge-a".into(),
            token: "tok".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let task = state.bus.create(TaskKind::ConfigUpdate, 1).await.unwrap();
    state
        .bus
        .report_status(&task.id, TaskStatus::Running, None)
        .await
        .unwrap();
    state
        .bus
        .report_status(&task.id, TaskStatus::Failed, Some("wg exploded".into()))
        .await
        .unwrap();

    // Nothing moves a terminal task
    for next in [TaskStatus::Running, TaskStatus::Success, TaskStatus::Canceled] {
        assert!(state.bus.report_status(&task.id, next, None).await.is_err());
    }
    let stored = store.get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("wg exploded"));
}

#[tokio::test]
async fn broadcast_reaches_online_nodes_and_parks_the_rest() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let server = MeshServer::new(&test_config(), store.clone());
    let state = server.state().clone();
    let bus = state.bus.clone().with_stagger(Duration::from_millis(1));

    for name in ["edge-a", "edge-b", "edge-c"] {
        store
            .create_node(NewNode {
                name: name.into(),
                token: format!("token-{name}"),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    // Node 2 is online with a bound stream; 1 and 3 are offline.
    state.registry.register(2, "token-edge-b".into()).await;
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    state.registry.bind_stream(2, tx).await.unwrap();

    let tasks = bus.broadcast_config_update().await.unwrap();
    assert_eq!(tasks.len(), 3);

    let delivered = rx.recv().await.unwrap().unwrap();
    assert_eq!(delivered.kind, "config_update");

    let pending = store
        .list_tasks(TaskFilter {
            status: Some(TaskStatus::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 3);
}

// =========================================================================
// Delete cascade
// =========================================================================

#[tokio::test]
async fn deleting_a_node_removes_its_edges_and_status() {
    let (state, app) = test_server();
    let auth = bearer(&state);

    let a = create_node_via_api(&app, &auth, "edge-a", "1.1.1.1").await;
    create_node_via_api(&app, &auth, "edge-b", "2.2.2.2").await;
    fetch_agent_config(&app, 1, a["token"].as_str().unwrap()).await;
    assert_eq!(state.store.list_pair_ports().await.unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/dashboard/nodes/1")
                .header(header::AUTHORIZATION, auth.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert!(state.store.get_node(1).await.is_err());
    assert!(state
        .store
        .list_pair_ports()
        .await
        .unwrap()
        .iter()
        .all(|p| p.node_id != 1 && p.peer_id != 1));
}
