//! Panel (C6 + C7): the authoritative orchestrator process. Wires
//! `PanelOrchestrator` with an in-memory `Store`, the local `Supervisor`
//! and `Accountant` for panel-hosted engines, and a `reqwest`-backed
//! `NodeRpcClient`; runs the restoration loop once at boot, then the
//! auto-reapply background task and the narrow HTTP surface side by side.

mod config;
mod http;
mod reapply;
mod rpc_client;

use std::sync::Arc;

use tunnelmux_core::accountant::{Accountant, PacketFilterAccountant};
use tunnelmux_core::derive::PanelHostHint;
use tunnelmux_core::orchestrator::PanelOrchestrator;
use tunnelmux_core::restore;
use tunnelmux_core::rpc::NodeRpcClient;
use tunnelmux_core::store::{InMemoryStore, Store};
use tunnelmux_core::supervisor::{ChildSupervisor, Supervisor};

use crate::config::PanelConfig;
use crate::rpc_client::ReqwestNodeRpcClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
  tracing_subscriber::fmt().with_env_filter(log_filter).init();

  let config = PanelConfig::from_env()?;
  tracing::info!(bind_addr = %config.bind_addr, panel_api_port = config.panel_api_port, "tunnelmux-panel starting");

  let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
  let rpc: Arc<dyn NodeRpcClient> = Arc::new(ReqwestNodeRpcClient::new());
  let local_supervisor: Arc<dyn Supervisor> = Arc::new(ChildSupervisor::default());
  let local_accountant: Arc<dyn Accountant> = Arc::new(PacketFilterAccountant::new());

  let panel_host_hint = PanelHostHint {
    user_panel_host: None,
    forwarded_host: None,
    request_hostname: None,
    env_panel_public_ip: config.panel_public_ip.clone(),
  };

  let orchestrator = Arc::new(PanelOrchestrator::new(
    Arc::clone(&store),
    rpc,
    local_supervisor,
    local_accountant,
    config.panel_api_port,
    panel_host_hint,
  ));

  let report = restore::restore_all(&orchestrator, &store).await;
  tracing::info!(
    panel_local = report.panel_local_applied,
    node_side = report.node_side_applied,
    failed = report.failed.len(),
    "startup restoration complete"
  );

  let reapply_task = reapply::spawn(Arc::clone(&orchestrator), config.reapply_poll_interval);

  let app = http::router(Arc::clone(&orchestrator));

  axum::Server::bind(&config.bind_addr)
    .serve(app.into_make_service())
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  reapply_task.abort();
  tracing::info!("tunnelmux-panel shut down");
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
