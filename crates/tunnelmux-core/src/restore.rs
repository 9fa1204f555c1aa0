//! Restoration loop: run at panel boot (and by the auto-reapply background
//! task) to bring every persisted tunnel back to its declared state after a
//! crash or restart. Ordering matters: panel-local engines first (so
//! control ports are listening before anything tries to dial them), then
//! panel-local forwards, then node-side applications.

use std::sync::Arc;
use std::time::Duration;

use crate::derive::EndpointTarget;
use crate::model::{Core, Tunnel};
use crate::orchestrator::PanelOrchestrator;
use crate::store::Store;

/// How long to wait after starting panel-local server/forwarder engines
/// before applying node-side clients, giving control ports time to bind.
const PANEL_LOCAL_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Clone)]
pub struct RestorationReport {
  pub panel_local_applied: usize,
  pub node_side_applied: usize,
  pub failed: Vec<(String, String)>,
}

fn is_panel_hosted(tunnel: &Tunnel) -> bool {
  matches!(tunnel.core, Core::Chisel | Core::Frp)
    || (tunnel.core == Core::Gost && tunnel.iran_node_id.is_none())
}

/// Run the restoration loop once: panel-local engines and forwards, settle,
/// then everything else (node-side clients/servers of reverse tunnels).
pub async fn restore_all(orchestrator: &PanelOrchestrator, store: &Arc<dyn Store>) -> RestorationReport {
  let tunnels = store.list_tunnels().await;
  let (panel_hosted, node_hosted): (Vec<_>, Vec<_>) = tunnels.into_iter().partition(is_panel_hosted);

  let mut report = RestorationReport::default();

  for tunnel in &panel_hosted {
    match orchestrator.apply_tunnel(&tunnel.id).await {
      Ok(()) => report.panel_local_applied += 1,
      Err(e) => report.failed.push((tunnel.id.clone(), e.to_string())),
    }
  }

  if !panel_hosted.is_empty() {
    tokio::time::sleep(PANEL_LOCAL_SETTLE).await;
  }

  for tunnel in &node_hosted {
    match orchestrator.apply_tunnel(&tunnel.id).await {
      Ok(()) => report.node_side_applied += 1,
      Err(e) => report.failed.push((tunnel.id.clone(), e.to_string())),
    }
  }

  tracing::info!(
    panel_local = report.panel_local_applied,
    node_side = report.node_side_applied,
    failed = report.failed.len(),
    "restoration loop complete"
  );
  report
}

/// Whether a derived endpoint targets the panel process itself, used by
/// callers that need to distinguish panel-local from node-hosted work at a
/// finer grain than [`is_panel_hosted`] (e.g. gost dispatched to an iran
/// node still counts as node-hosted even though gost has no client half).
pub fn targets_panel(target: &EndpointTarget) -> bool {
  matches!(target, EndpointTarget::Panel)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chisel_and_frp_are_panel_hosted() {
    let mut t = test_tunnel(Core::Chisel);
    assert!(is_panel_hosted(&t));
    t.core = Core::Frp;
    assert!(is_panel_hosted(&t));
  }

  #[test]
  fn gost_is_panel_hosted_only_without_iran_node() {
    let mut t = test_tunnel(Core::Gost);
    t.iran_node_id = None;
    assert!(is_panel_hosted(&t));
    t.iran_node_id = Some("iran".to_string());
    assert!(!is_panel_hosted(&t));
  }

  #[test]
  fn rathole_and_backhaul_are_not_panel_hosted() {
    let mut t = test_tunnel(Core::Rathole);
    assert!(!is_panel_hosted(&t));
    t.core = Core::Backhaul;
    assert!(!is_panel_hosted(&t));
  }

  fn test_tunnel(core: Core) -> Tunnel {
    let now = chrono::Utc::now();
    Tunnel {
      id: crate::model::new_id(),
      name: "t".to_string(),
      core,
      kind: "tcp".to_string(),
      node_id: None,
      iran_node_id: None,
      foreign_node_id: None,
      spec: Default::default(),
      status: crate::model::TunnelStatus::Pending,
      error_message: None,
      revision: 0,
      used_mb: 0.0,
      quota_mb: 0.0,
      created_at: now,
      updated_at: now,
    }
  }
}
