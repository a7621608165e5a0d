use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use conduit_control::state::AppState;
use conduit_control::node_ws;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct VersionData {
    agent: String,
    agent2: String,
}

#[derive(Debug, Serialize)]
struct ApiEnvelope<T> {
    code: i64,
    data: T,
}

/// `GET /api/v1/version` — expected agent versions, consumed by agents
/// for the counterpart cross-check.
async fn version(State(state): State<AppState>) -> Json<ApiEnvelope<VersionData>> {
    Json(ApiEnvelope {
        code: 0,
        data: VersionData {
            agent: state.expected.agent.clone(),
            agent2: state.expected.agent2.clone(),
        },
    })
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    online_nodes: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online_nodes: state.registry.online_nodes().await.len(),
    })
}

fn artifact_dir() -> PathBuf {
    std::env::var("CONDUIT_ARTIFACT_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/lib/conduit/artifacts"))
}

/// `GET /conduit-agent/:name` — role/arch-named agent binaries for the
/// self-upgrade protocol.
async fn artifact(Path(name): Path<String>) -> impl IntoResponse {
    if name.contains('/') || name.contains("..") || !name.starts_with("conduit-agent") {
        return (StatusCode::NOT_FOUND, "no such artifact").into_response();
    }
    match tokio::fs::read(artifact_dir().join(&name)).await {
        Ok(bytes) => bytes.into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "no such artifact").into_response(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let state = AppState::from_env();

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/system-info", get(node_ws::system_info_ws))
        .route("/api/v1/version", get(version))
        .route("/conduit-agent/:name", get(artifact))
        .with_state(state);

    let addr: SocketAddr = std::env::var("CONDUIT_BIND")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| ([0, 0, 0, 0], 8080).into());
    tracing::info!(%addr, "conduit-control HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
