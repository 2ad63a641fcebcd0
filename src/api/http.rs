//! HTTP API Server
//!
//! Registration endpoint plus operator views of the registry.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::registry::{PeerRecord, PeerRegistry};

/// Shared application state
pub struct AppState {
    /// The peer registry
    pub registry: Arc<PeerRegistry>,
    /// The server's own tunnel peer, listed first in every peer list
    pub server_peer: Option<(Identity, Ipv4Addr)>,
    /// Process start, for uptime
    pub started_at: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ApiConfig,
        registry: Arc<PeerRegistry>,
        server_peer: Option<(Identity, Ipv4Addr)>,
    ) -> Self {
        let state = Arc::new(AppState {
            registry,
            server_peer,
            started_at: Instant::now(),
        });

        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/register", post(handle_register))
            .route("/peers", get(handle_peers))
            .route("/peers/:pub", delete(handle_remove))
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .with_state(Arc::clone(&self.state))
            .layer(TimeoutLayer::new(self.config.request_timeout()))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router = router.layer(CorsLayer::permissive());
        }
        router
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| Error::Network(format!("API bind {}: {}", self.config.bind_address, e)))?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Registration request
#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterRequest {
    /// Base64 or hex public key
    #[serde(rename = "pub")]
    pub public_key: String,
}

/// One entry of a peer list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeerEntry {
    #[serde(rename = "pub")]
    pub public_key: String,
    pub ip: Ipv4Addr,
}

impl From<&PeerRecord> for PeerEntry {
    fn from(record: &PeerRecord) -> Self {
        Self {
            public_key: record.identity.to_base64(),
            ip: record.address,
        }
    }
}

/// Registration response
#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterResponse {
    /// Assigned address with the pool prefix, e.g. "10.0.0.2/24"
    pub ip: String,
    /// Every other peer
    pub peers: Vec<PeerEntry>,
}

/// Detailed peer view for operators
#[derive(Debug, Deserialize, Serialize)]
pub struct PeerDetail {
    #[serde(rename = "pub")]
    pub public_key: String,
    pub ip: Ipv4Addr,
    /// None for the server's own entry
    pub registered_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Peer list response
#[derive(Debug, Deserialize, Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerDetail>,
}

/// Status response
#[derive(Debug, Deserialize, Serialize)]
pub struct StatusResponse {
    pub cidr: String,
    pub peers: usize,
    pub capacity: usize,
    pub allocated: usize,
    pub free: usize,
    pub server_peer: Option<PeerEntry>,
    pub uptime_seconds: u64,
}

/// Health response
#[derive(Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub peers: usize,
}

/// Error response
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Error::InvalidIdentity(_) => (StatusCode::BAD_REQUEST, "INVALID_IDENTITY"),
            Error::PeerNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::PoolExhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "POOL_EXHAUSTED"),
            Error::Store(_) | Error::Recovery(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        error_response(status, code, self.to_string())
    }
}

fn server_entry(state: &AppState) -> Option<PeerEntry> {
    state.server_peer.map(|(identity, ip)| PeerEntry {
        public_key: identity.to_base64(),
        ip,
    })
}

fn is_server(state: &AppState, identity: &Identity) -> bool {
    matches!(state.server_peer, Some((id, _)) if id == *identity)
}

// ============ Handlers ============

async fn handle_register(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", rejection.body_text());
        }
    };

    let identity = match Identity::parse(&req.public_key) {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    // The server's address is reserved; it never takes one from the pool
    if let Some((server_id, server_ip)) = state.server_peer {
        if identity == server_id {
            let snapshot = state.registry.peers().await;
            return Json(RegisterResponse {
                ip: state.registry.with_prefix(server_ip).to_string(),
                peers: snapshot
                    .iter()
                    .filter(|p| p.identity != server_id)
                    .map(PeerEntry::from)
                    .collect(),
            })
            .into_response();
        }
    }

    // Run to completion even if the caller disconnects or times out
    let registry = Arc::clone(&state.registry);
    let result = tokio::spawn(async move { registry.register(identity).await }).await;

    let registration = match result {
        Ok(Ok(registration)) => registration,
        Ok(Err(e)) => return e.into_response(),
        Err(e) => return Error::Internal(format!("registration task: {}", e)).into_response(),
    };

    let peers = server_entry(&state)
        .into_iter()
        .chain(
            registration
                .peers
                .iter()
                .filter(|p| !is_server(&state, &p.identity))
                .map(PeerEntry::from),
        )
        .collect();

    Json(RegisterResponse {
        ip: registration.address.to_string(),
        peers,
    })
    .into_response()
}

async fn handle_peers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.registry.peers().await;

    let mut peers = Vec::with_capacity(snapshot.len() + 1);
    if let Some(entry) = server_entry(&state) {
        peers.push(PeerDetail {
            public_key: entry.public_key,
            ip: entry.ip,
            registered_at: None,
            last_seen: None,
        });
    }
    peers.extend(snapshot.iter().filter(|p| !is_server(&state, &p.identity)).map(|p| PeerDetail {
        public_key: p.identity.to_base64(),
        ip: p.address,
        registered_at: Some(p.registered_at),
        last_seen: Some(p.last_seen),
    }));

    Json(PeersResponse { peers })
}

async fn handle_remove(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    let identity = match Identity::parse(&key) {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let registry = Arc::clone(&state.registry);
    match tokio::spawn(async move { registry.remove(&identity).await }).await {
        Ok(Ok(record)) => Json(PeerEntry::from(&record)).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => Error::Internal(format!("removal task: {}", e)).into_response(),
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats().await;
    Json(StatusResponse {
        cidr: stats.cidr,
        peers: stats.peers,
        capacity: stats.capacity,
        allocated: stats.allocated,
        free: stats.free,
        server_peer: server_entry(&state),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        peers: state.registry.peers().await.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AddressPool;
    use crate::registry::PeerStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn id(n: u8) -> Identity {
        Identity::from_bytes([n; 32])
    }

    fn server(cidr: &str, server_peer: Option<(Identity, Ipv4Addr)>) -> HttpServer {
        let net: ipnet::Ipv4Net = cidr.parse().unwrap();
        let first = Ipv4Addr::from(u32::from(net.network()) + 1);
        let pool = AddressPool::new(net, &[first]).unwrap();
        let (registry, _) =
            PeerRegistry::recover(PeerStore::open_in_memory().unwrap(), pool, None).unwrap();
        HttpServer::new(ApiConfig::default(), Arc::new(registry), server_peer)
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn register_req(key: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/register")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({ "pub": key }).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_end_to_end() {
        let router = server("10.0.0.0/24", None).router();

        let (status, body) = send(&router, register_req(&id(1).to_base64())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ip"], "10.0.0.2/24");
        assert_eq!(body["peers"], serde_json::json!([]));

        let (_, body) = send(&router, register_req(&id(2).to_base64())).await;
        assert_eq!(body["ip"], "10.0.0.3/24");
        assert_eq!(
            body["peers"],
            serde_json::json!([{ "pub": id(1).to_base64(), "ip": "10.0.0.2" }])
        );

        // Hex form of the same key is the same identity
        let (_, body) = send(&router, register_req(&hex::encode(id(1).as_bytes()))).await;
        assert_eq!(body["ip"], "10.0.0.2/24");
        assert_eq!(
            body["peers"],
            serde_json::json!([{ "pub": id(2).to_base64(), "ip": "10.0.0.3" }])
        );
    }

    #[tokio::test]
    async fn test_register_rejects_bad_identity() {
        let srv = server("10.0.0.0/24", None);
        let router = srv.router();

        for key in ["", "short", "!!!!"] {
            let (status, body) = send(&router, register_req(key)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["code"], "INVALID_IDENTITY");
        }
        assert_eq!(srv.state().registry.stats().await.allocated, 0);
    }

    #[tokio::test]
    async fn test_register_rejects_malformed_json() {
        let router = server("10.0.0.0/24", None).router();
        let req = Request::builder()
            .method("POST")
            .uri("/register")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let (status, body) = send(&router, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_pool_exhausted_is_503() {
        // /30: network, broadcast and .1 reserved leaves one address
        let router = server("10.1.0.0/30", None).router();
        let (status, _) = send(&router, register_req(&id(1).to_base64())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&router, register_req(&id(2).to_base64())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "POOL_EXHAUSTED");
    }

    #[tokio::test]
    async fn test_server_peer_listed_first() {
        let server_id = id(200);
        let router = server("10.0.0.0/24", Some((server_id, Ipv4Addr::new(10, 0, 0, 1)))).router();

        send(&router, register_req(&id(1).to_base64())).await;
        let (_, body) = send(&router, register_req(&id(2).to_base64())).await;
        let peers = body["peers"].as_array().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0]["pub"], server_id.to_base64());
        assert_eq!(peers[0]["ip"], "10.0.0.1");
        assert_eq!(peers[1]["ip"], "10.0.0.2");

        let req = Request::builder().uri("/peers").body(Body::empty()).unwrap();
        let (status, body) = send(&router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["peers"].as_array().unwrap().len(), 3);
        assert!(body["peers"][0]["registered_at"].is_null());
    }

    #[tokio::test]
    async fn test_server_identity_keeps_reserved_address() {
        let server_id = id(200);
        let srv = server("10.0.0.0/24", Some((server_id, Ipv4Addr::new(10, 0, 0, 1))));
        let router = srv.router();

        send(&router, register_req(&id(1).to_base64())).await;
        let (status, body) = send(&router, register_req(&server_id.to_base64())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ip"], "10.0.0.1/24");
        assert_eq!(
            body["peers"],
            serde_json::json!([{ "pub": id(1).to_base64(), "ip": "10.0.0.2" }])
        );
        assert_eq!(srv.state().registry.stats().await.allocated, 1);

        let (_, body) = send(&router, register_req(&id(2).to_base64())).await;
        assert_eq!(body["ip"], "10.0.0.3/24");
        let listed = body["peers"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|p| p["pub"] == server_id.to_base64())
            .count();
        assert_eq!(listed, 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.db");
        let pool = AddressPool::new("10.0.0.0/24".parse().unwrap(), &[Ipv4Addr::new(10, 0, 0, 1)]).unwrap();
        let (registry, _) = PeerRegistry::recover(PeerStore::open(&path).unwrap(), pool, None).unwrap();
        let router = HttpServer::new(ApiConfig::default(), Arc::new(registry), None).router();

        // A row written behind the registry's back holds the next free address
        let mut other = PeerStore::open(&path).unwrap();
        other
            .insert_if_absent(&PeerRecord::new(id(99), Ipv4Addr::new(10, 0, 0, 2), Utc::now()))
            .unwrap();

        let (status, body) = send(&router, register_req(&id(1).to_base64())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "STORE_ERROR");

        let req = Request::builder().uri("/status").body(Body::empty()).unwrap();
        let (_, body) = send(&router, req).await;
        assert_eq!(body["peers"], 0);
        assert_eq!(body["allocated"], 0);
    }

    #[tokio::test]
    async fn test_remove_peer() {
        let srv = server("10.0.0.0/24", None);
        let router = srv.router();
        send(&router, register_req(&id(1).to_base64())).await;

        let uri = format!("/peers/{}", hex::encode(id(1).as_bytes()));
        let req = Request::builder().method("DELETE").uri(&uri).body(Body::empty()).unwrap();
        let (status, body) = send(&router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ip"], "10.0.0.2");

        let req = Request::builder().method("DELETE").uri(&uri).body(Body::empty()).unwrap();
        let (status, body) = send(&router, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");

        let req = Request::builder()
            .method("DELETE")
            .uri("/peers/garbage")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_and_health() {
        let router = server("10.0.0.0/24", None).router();
        send(&router, register_req(&id(1).to_base64())).await;

        let req = Request::builder().uri("/status").body(Body::empty()).unwrap();
        let (status, body) = send(&router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cidr"], "10.0.0.0/24");
        assert_eq!(body["peers"], 1);
        assert_eq!(body["capacity"], 253);
        assert_eq!(body["free"], 252);

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
    }
}
