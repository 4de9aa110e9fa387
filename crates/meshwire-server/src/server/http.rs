//! Dashboard and agent-facing HTTP API.
//!
//! Three route groups on the shared listener:
//! - `/api/auth/*`: account registration and login
//! - `/api/dashboard/*`: JWT-guarded fleet management
//! - `/api/agent/config/{id}`: node-token (HTTP Basic) config fetch

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use meshwire_core::bundle::ConfigBundle;

use crate::auth::{password, Claims, JwtManager};
use crate::confgen::ConfigGenerator;
use crate::error::{Result, ServerError};
use crate::identity::{generate_keypair, generate_node_token, TokenVerifier};
use crate::registry::SessionRegistry;
use crate::storage::{NewNode, Node, NodeUpdate, Store, TaskKind};
use crate::tasks::TaskBus;

/// Default MTU for mesh tunnels.
const DEFAULT_MTU: u32 = 1420;
/// Default babeld update interval in milliseconds.
const DEFAULT_BABEL_INTERVAL: u32 = 5000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub bus: TaskBus,
    pub generator: ConfigGenerator,
    pub registry: SessionRegistry,
    pub verifier: TokenVerifier,
    pub jwt: JwtManager,
}

pub fn router(state: AppState) -> Router {
    let dashboard = Router::new()
        .route("/nodes", get(list_nodes).post(create_node))
        .route("/nodes/:id", get(get_node).delete(delete_node))
        .route("/nodes/config/:id", post(trigger_config_update))
        .route("/status", get(dashboard_status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    Router::new()
        .route("/api/auth/register", post(register_user))
        .route("/api/auth/login", post(login))
        .nest("/api/dashboard", dashboard)
        .route("/api/agent/config/:id", get(agent_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =========================================================================
// Auth
// =========================================================================

#[derive(Deserialize)]
struct CredentialsRequest {
    username: String,
    password: String,
}

#[instrument(skip_all)]
async fn register_user(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Response> {
    if req.username.len() < 3 {
        return Err(ServerError::Validation(
            "username must be at least 3 characters".into(),
        ));
    }
    if req.password.len() < 8 {
        return Err(ServerError::Validation(
            "password must be at least 8 characters".into(),
        ));
    }
    if state.store.user_exists(&req.username).await? {
        return Err(ServerError::Conflict("username already exists".into()));
    }

    let hash = password::hash_password(&req.password)
        .map_err(|e| ServerError::Internal(format!("password hashing: {e}")))?;
    let user = state.store.create_user(&req.username, &hash).await?;

    info!(user_id = user.id, username = %user.username, "User registered");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "user registered",
            "user": { "id": user.id, "username": user.username },
        })),
    )
        .into_response())
}

#[instrument(skip_all)]
async fn login(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Response> {
    let user = state
        .store
        .get_user_by_username(&req.username)
        .await
        .map_err(|_| ServerError::Unauthenticated("invalid username or password".into()))?;

    let valid = password::verify_password(&req.password, &user.password_hash)
        .map_err(|e| ServerError::Internal(format!("password verification: {e}")))?;
    if !valid {
        warn!(username = %req.username, "Failed login attempt");
        return Err(ServerError::Unauthenticated(
            "invalid username or password".into(),
        ));
    }

    let token = state
        .jwt
        .issue(user.id, &user.username)
        .map_err(|e| ServerError::Internal(format!("token issuance: {e}")))?;

    info!(user_id = user.id, username = %user.username, "User logged in");

    Ok(Json(json!({
        "token": token,
        "user": { "id": user.id, "username": user.username },
    }))
    .into_response())
}

/// Bearer-token guard for the dashboard group.
async fn require_session(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ServerError::Unauthenticated("missing bearer token".into()))?;

    let claims = state
        .jwt
        .validate(token)
        .map_err(|_| ServerError::Unauthenticated("invalid session token".into()))?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

// =========================================================================
// Dashboard
// =========================================================================

/// Node as shown to dashboard users: no token, no private key.
#[derive(Serialize)]
struct NodeView {
    id: i64,
    name: String,
    public_key: String,
    endpoints: Vec<String>,
    ipv4: String,
    ipv6: String,
    online: bool,
    created_at: i64,
    updated_at: i64,
}

impl NodeView {
    fn from_node(node: Node, online: bool) -> Self {
        Self {
            id: node.id,
            name: node.name,
            public_key: node.public_key,
            endpoints: node.endpoints,
            ipv4: node.ipv4,
            ipv6: node.ipv6,
            online,
            created_at: node.created_at,
            updated_at: node.updated_at,
        }
    }
}

async fn list_nodes(State(state): State<AppState>) -> Result<Response> {
    let nodes = state.store.list_nodes().await?;
    let mut views = Vec::with_capacity(nodes.len());
    for node in nodes {
        let online = state.registry.is_online(node.id).await;
        views.push(NodeView::from_node(node, online));
    }
    Ok(Json(views).into_response())
}

#[derive(Deserialize)]
struct CreateNodeRequest {
    name: String,
    endpoint: String,
}

#[instrument(skip_all)]
async fn create_node(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateNodeRequest>,
) -> Result<Response> {
    if req.name.is_empty() {
        return Err(ServerError::Validation("name is required".into()));
    }

    let keypair = generate_keypair();
    let token = generate_node_token();

    let created = state
        .store
        .create_node(NewNode {
            id: None,
            name: req.name,
            token: token.clone(),
            public_key: keypair.public_key.clone(),
            private_key: keypair.private_key,
            endpoints: vec![req.endpoint],
            ipv4: String::new(),
            ipv6: String::new(),
            mtu: DEFAULT_MTU,
            babel_interval: DEFAULT_BABEL_INTERVAL,
        })
        .await?;

    // Node addresses derive from the identifier, which the store just
    // assigned.
    let (ipv4, ipv6) = state.generator.node_addresses(created.id);
    let node = state
        .store
        .update_node(
            created.id,
            NodeUpdate {
                ipv4: Some(ipv4),
                ipv6: Some(ipv6),
                ..Default::default()
            },
        )
        .await?;

    info!(node_id = node.id, name = %node.name, by = %claims.username, "Node created");

    // Every member's config now names a new peer; refresh the fleet in
    // the background, staggered.
    let bus = state.bus.clone();
    tokio::spawn(async move {
        if let Err(e) = bus.broadcast_config_update().await {
            warn!(error = %e, "Fleet config broadcast failed");
        }
    });

    // The token is revealed here, exactly once.
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": node.id,
            "name": node.name,
            "token": token,
            "public_key": node.public_key,
        })),
    )
        .into_response())
}

async fn get_node(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Response> {
    let node = state.store.get_node(id).await?;
    let online = state.registry.is_online(node.id).await;
    Ok(Json(NodeView::from_node(node, online)).into_response())
}

#[instrument(skip_all)]
async fn delete_node(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> Result<Response> {
    state.store.delete_node(id).await?;
    state.registry.remove(id).await;
    info!(node_id = id, by = %claims.username, "Node deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn trigger_config_update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response> {
    let task = state.bus.create(TaskKind::ConfigUpdate, id).await?;
    Ok(Json(json!({ "status": "ok", "task_id": task.id })).into_response())
}

async fn dashboard_status(State(state): State<AppState>) -> Result<Response> {
    let statuses = state.store.list_node_status().await?;
    Ok(Json(statuses).into_response())
}

// =========================================================================
// Agent
// =========================================================================

#[instrument(skip_all)]
async fn agent_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ConfigBundle>> {
    let (auth_id, token) = parse_basic_auth(&headers)?;
    if auth_id != id || !state.verifier.verify(id, &token).await {
        return Err(ServerError::Unauthenticated("invalid node token".into()));
    }

    let bundle = state.generator.generate(id).await?;
    state.registry.touch(id).await;
    Ok(Json(bundle))
}

/// Parse `Authorization: Basic base64("{node_id}:{token}")`.
fn parse_basic_auth(headers: &HeaderMap) -> Result<(i64, String)> {
    let encoded = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or_else(|| ServerError::Unauthenticated("basic authentication required".into()))?;

    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| ServerError::Unauthenticated("malformed basic credentials".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| ServerError::Unauthenticated("malformed basic credentials".into()))?;

    let (id, token) = decoded
        .split_once(':')
        .ok_or_else(|| ServerError::Unauthenticated("malformed basic credentials".into()))?;
    let id = id
        .parse::<i64>()
        .map_err(|_| ServerError::Validation("invalid node id in credentials".into()))?;

    Ok((id, token.to_string()))
}
