//! The panel's HTTP surface. Deliberately narrow: this is not the
//! admin-facing CRUD API (that framing is out of scope — admin operations
//! are invoked as direct orchestrator calls, e.g. from the CLI binary, not
//! routed through HTTP). The only routes here are the node-facing usage push
//! and a couple of read/settings endpoints the CLI needs to reach a panel
//! running as a separate process.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tunnelmux_core::model::{Node, Settings, Tunnel};
use tunnelmux_core::orchestrator::PanelOrchestrator;
use tunnelmux_core::rpc::UsagePushRequest;

pub fn router(orchestrator: Arc<PanelOrchestrator>) -> Router {
  Router::new()
    .route("/panel/usage/push", post(push_usage))
    .route("/panel/status", get(status))
    .route("/panel/settings", get(get_settings).put(put_settings))
    .with_state(orchestrator)
}

async fn push_usage(State(orchestrator): State<Arc<PanelOrchestrator>>, Json(req): Json<UsagePushRequest>) -> StatusCode {
  for reading in req.readings {
    if let Err(e) = orchestrator.push_usage(&reading.tunnel_id, Some(&req.node_id), reading.used_mb).await {
      tracing::debug!(tunnel_id = %reading.tunnel_id, node_id = %req.node_id, error = %e, "usage reading processed with a non-fatal error");
    }
  }
  StatusCode::OK
}

#[derive(Serialize)]
struct StatusView {
  nodes: Vec<Node>,
  tunnels: Vec<Tunnel>,
}

async fn status(State(orchestrator): State<Arc<PanelOrchestrator>>) -> Json<StatusView> {
  Json(StatusView {
    nodes: orchestrator.list_nodes().await,
    tunnels: orchestrator.list_tunnels().await,
  })
}

async fn get_settings(State(orchestrator): State<Arc<PanelOrchestrator>>) -> Json<Settings> {
  Json(orchestrator.get_settings().await)
}

async fn put_settings(State(orchestrator): State<Arc<PanelOrchestrator>>, Json(settings): Json<Settings>) -> StatusCode {
  orchestrator.put_settings(settings).await;
  StatusCode::NO_CONTENT
}
