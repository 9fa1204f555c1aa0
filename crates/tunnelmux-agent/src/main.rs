//! Node agent (C4, node side): the process that runs on every iran/foreign
//! node. Receives already-rendered engine invocations from the panel over
//! HTTP, supervises the resulting subprocess, accounts its traffic, and
//! periodically reports usage back.

mod config;
mod handlers;
mod state;
mod usage_push;

use std::collections::HashMap;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::Mutex;
use tunnelmux_core::accountant::{Accountant, PacketFilterAccountant};
use tunnelmux_core::supervisor::{ChildSupervisor, Supervisor};

use crate::config::AgentConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
  tracing_subscriber::fmt().with_env_filter(log_filter).init();

  let config = AgentConfig::from_env()?;
  tracing::info!(node_id = %config.node_id, bind_addr = %config.bind_addr, "tunnelmux-agent starting");

  let supervisor: Arc<dyn Supervisor> = Arc::new(ChildSupervisor::default());
  let accountant: Arc<dyn Accountant> = Arc::new(PacketFilterAccountant::new());

  let state = Arc::new(AppState {
    node_id: config.node_id.clone(),
    supervisor,
    accountant,
    tunnels: Mutex::new(HashMap::new()),
    stop_grace: config.stop_grace,
  });

  let usage_task = config
    .panel_base_url
    .clone()
    .map(|panel_url| usage_push::spawn(Arc::clone(&state), panel_url, config.usage_push_interval));

  let app = Router::new()
    .route("/agent/tunnels/apply", post(handlers::apply_tunnel))
    .route("/agent/tunnels/remove", post(handlers::remove_tunnel))
    .route("/agent/tunnels/status/:id", get(handlers::tunnel_status))
    .route("/agent/status", get(handlers::node_status))
    .with_state(state);

  tracing::info!("agent listening");

  axum::Server::bind(&config.bind_addr)
    .serve(app.into_make_service())
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  if let Some(task) = usage_task {
    task.abort();
  }
  tracing::info!("tunnelmux-agent shut down");
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = tokio::signal::ctrl_c();
  #[cfg(unix)]
  {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
      .expect("failed to register SIGTERM handler");
    tokio::select! {
      _ = ctrl_c => tracing::info!("received SIGINT"),
      _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
  }
  #[cfg(not(unix))]
  {
    ctrl_c.await.ok();
    tracing::info!("received SIGINT");
  }
}
