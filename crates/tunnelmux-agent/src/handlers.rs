//! HTTP handlers for the node agent's half of the RPC contract. The panel
//! already rendered argv/config/counter target (C3 adapters run panel-side);
//! the agent's job is just to write the config file, spawn/stop the engine
//! process and install/remove the packet-filter counters, then answer status
//! queries against that local state.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use tunnelmux_core::model::TunnelId;
use tunnelmux_core::rpc::{
  ApplyTunnelRequest, ApplyTunnelResponse, NodeStatusResponse, RemoveTunnelRequest, TunnelStatusResponse,
};

use crate::state::{ApiError, AppState, TunnelRuntime};

pub async fn apply_tunnel(
  State(state): State<Arc<AppState>>,
  Json(req): Json<ApplyTunnelRequest>,
) -> Result<Json<ApplyTunnelResponse>, ApiError> {
  if let Some(cfg) = &req.config_file {
    let path = std::path::Path::new(&cfg.path);
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await.map_err(|e| {
        anyhow::anyhow!("failed to create config dir {}: {e}", parent.display())
      })?;
    }
    tokio::fs::write(path, &cfg.contents)
      .await
      .map_err(|e| anyhow::anyhow!("failed to write config file {}: {e}", path.display()))?;
  }

  let log_path = tunnelmux_core::adapters::log_path(req.core, &req.tunnel_id);
  if let Some(parent) = log_path.parent() {
    tokio::fs::create_dir_all(parent)
      .await
      .map_err(|e| anyhow::anyhow!("failed to create log dir {}: {e}", parent.display()))?;
  }

  state.supervisor.spawn(&req.tunnel_id, req.argv, req.env, log_path).await?;
  let pid = state.supervisor.pid(&req.tunnel_id).await;

  if let Some(target) = req.counter_target.clone() {
    state.accountant.install(&req.tunnel_id, target.into()).await?;
  }

  state
    .tunnels
    .lock()
    .await
    .insert(req.tunnel_id.clone(), TunnelRuntime { core: req.core });

  tracing::info!(tunnel_id = %req.tunnel_id, ?pid, "tunnel applied");
  Ok(Json(ApplyTunnelResponse {
    tunnel_id: req.tunnel_id,
    pid,
  }))
}

pub async fn remove_tunnel(
  State(state): State<Arc<AppState>>,
  Json(req): Json<RemoveTunnelRequest>,
) -> Result<(), ApiError> {
  state.supervisor.stop(&req.tunnel_id, state.stop_grace).await?;
  state.accountant.remove(&req.tunnel_id).await;
  state.tunnels.lock().await.remove(&req.tunnel_id);
  tracing::info!(tunnel_id = %req.tunnel_id, "tunnel removed");
  Ok(())
}

pub async fn tunnel_status(
  State(state): State<Arc<AppState>>,
  Path(tunnel_id): Path<TunnelId>,
) -> Result<Json<TunnelStatusResponse>, ApiError> {
  Ok(Json(status_of(&state, &tunnel_id).await?))
}

pub async fn node_status(State(state): State<Arc<AppState>>) -> Result<Json<NodeStatusResponse>, ApiError> {
  let ids: Vec<TunnelId> = state.tunnels.lock().await.keys().cloned().collect();
  let mut tunnels = Vec::with_capacity(ids.len());
  for id in ids {
    tunnels.push(status_of(&state, &id).await?);
  }
  Ok(Json(NodeStatusResponse {
    node_id: state.node_id.clone(),
    tunnels,
    agent_version: env!("CARGO_PKG_VERSION").to_string(),
  }))
}

async fn status_of(state: &AppState, tunnel_id: &str) -> Result<TunnelStatusResponse, ApiError> {
  let probe = state.supervisor.probe(tunnel_id).await;
  let pid = state.supervisor.pid(tunnel_id).await;
  let used_mb = state.accountant.read_usage_mb(tunnel_id, pid).await?;
  Ok(TunnelStatusResponse {
    tunnel_id: tunnel_id.to_string(),
    process_running: probe.process_running,
    state: probe.state.into(),
    used_mb,
  })
}
