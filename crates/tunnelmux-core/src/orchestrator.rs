//! Panel orchestrator: the single authority that creates, updates, applies
//! and tears down tunnels, and aggregates status/usage across nodes. One
//! coordinator owning a `Store` + `Supervisor`/`Accountant` (for panel-local
//! engines) + `NodeRpcClient` (for node-hosted ones), serializing per-tunnel
//! work so concurrent apply/update/delete on the same tunnel can't race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::Instrument;

use crate::accountant::Accountant;
use crate::adapters::{adapter_for, log_path};
use crate::derive::{derive_tunnel_specs, normalize_spec_ports, EndpointSpec, EndpointTarget, PanelHostHint};
use crate::error::{OrchestratorError, Result};
use crate::model::{new_id, Core, Node, Settings, Tunnel, TunnelId, TunnelStatus, UsageRecord};
use crate::ports::parse_ports;
use crate::rpc::{ApplyTunnelRequest, ConfigFilePayload, NodeEndpoint, NodeRpcClient, RemoveTunnelRequest};
use crate::store::Store;
use crate::supervisor::Supervisor;

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TunnelStatusView {
  pub tunnel: Tunnel,
  pub server_running: Option<bool>,
  pub client_running: Option<bool>,
}

pub struct PanelOrchestrator {
  store: Arc<dyn Store>,
  rpc: Arc<dyn NodeRpcClient>,
  local_supervisor: Arc<dyn Supervisor>,
  local_accountant: Arc<dyn Accountant>,
  panel_api_port: u16,
  panel_host_hint: PanelHostHint,
  tunnel_locks: Mutex<HashMap<TunnelId, Arc<Mutex<()>>>>,
}

impl PanelOrchestrator {
  pub fn new(
    store: Arc<dyn Store>,
    rpc: Arc<dyn NodeRpcClient>,
    local_supervisor: Arc<dyn Supervisor>,
    local_accountant: Arc<dyn Accountant>,
    panel_api_port: u16,
    panel_host_hint: PanelHostHint,
  ) -> Self {
    Self {
      store,
      rpc,
      local_supervisor,
      local_accountant,
      panel_api_port,
      panel_host_hint,
      tunnel_locks: Mutex::new(HashMap::new()),
    }
  }

  async fn lock_for(&self, tunnel_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
    let mut locks = self.tunnel_locks.lock().await;
    let lock = locks
      .entry(tunnel_id.to_string())
      .or_insert_with(|| Arc::new(Mutex::new(())))
      .clone();
    drop(locks);
    lock.lock_owned().await
  }

  async fn resolve_node(&self, node_id: &str) -> Result<Node> {
    self
      .store
      .get_node(node_id)
      .await
      .ok_or_else(|| OrchestratorError::NotFound(format!("node {node_id}")))
  }

  fn node_endpoint(node: &Node) -> Result<NodeEndpoint> {
    let api_address = node
      .api_address()
      .ok_or_else(|| OrchestratorError::Validation(format!("node {} has no ip_address/api_address", node.id)))?;
    Ok(NodeEndpoint {
      node_id: node.id.clone(),
      base_url: format!("http://{api_address}"),
    })
  }

  pub async fn register_node(&self, mut node: Node) -> Result<Node> {
    if node.id.is_empty() {
      node.id = new_id();
    }
    self.store.put_node(node.clone()).await;
    Ok(node)
  }

  /// A node referenced by any tunnel cannot be deleted.
  pub async fn delete_node(&self, node_id: &str) -> Result<()> {
    let referencing = self.store.tunnels_for_node(node_id).await;
    if !referencing.is_empty() {
      return Err(OrchestratorError::Conflict(format!(
        "node {node_id} is referenced by {} tunnel(s)",
        referencing.len()
      )));
    }
    self
      .store
      .delete_node(node_id)
      .await
      .ok_or_else(|| OrchestratorError::NotFound(format!("node {node_id}")))?;
    Ok(())
  }

  fn validate_roles(core: Core, iran: Option<&Node>, foreign: Option<&Node>) -> Result<()> {
    if !core.is_reverse() {
      return Ok(());
    }
    match core {
      Core::Rathole | Core::Backhaul => {
        if iran.is_none() || foreign.is_none() {
          return Err(OrchestratorError::Validation(format!(
            "{} requires both iran_node_id and foreign_node_id",
            core.as_str()
          )));
        }
      }
      Core::Chisel | Core::Frp => {
        if foreign.is_none() {
          return Err(OrchestratorError::Validation(format!(
            "{} requires foreign_node_id",
            core.as_str()
          )));
        }
      }
      Core::Gost => {}
    }
    if let Some(n) = iran {
      if n.role() != Some(crate::model::NodeRole::Iran) {
        return Err(OrchestratorError::Validation(format!("node {} is not role=iran", n.id)));
      }
    }
    if let Some(n) = foreign {
      if n.role() != Some(crate::model::NodeRole::Foreign) {
        return Err(OrchestratorError::Validation(format!("node {} is not role=foreign", n.id)));
      }
    }
    Ok(())
  }

  /// CreateTunnel: persist, then resolve nodes and dispatch immediately.
  /// A dispatch failure leaves the tunnel persisted with `status=error`
  /// rather than failing the whole call silently-pending.
  pub async fn create_tunnel(&self, mut tunnel: Tunnel) -> Result<Tunnel> {
    if tunnel.id.is_empty() {
      tunnel.id = new_id();
    }
    let now = chrono::Utc::now();
    tunnel.status = TunnelStatus::Pending;
    tunnel.error_message = None;
    tunnel.created_at = now;
    tunnel.updated_at = now;
    self.normalize_and_validate(&mut tunnel).await?;
    self.store.put_tunnel(tunnel.clone()).await;

    let _guard = self.lock_for(&tunnel.id).await;
    self.apply_tunnel_inner(&tunnel.id).await?;
    let tunnel = self
      .store
      .get_tunnel(&tunnel.id)
      .await
      .ok_or_else(|| OrchestratorError::NotFound(format!("tunnel {}", tunnel.id)))?;
    Ok(tunnel)
  }

  /// UpdateTunnel: patches that only touch metadata (name, quota, ...) are
  /// persisted without disturbing a running engine. A spec change is
  /// re-applied as if the tunnel had just been created.
  pub async fn update_tunnel(&self, mut tunnel: Tunnel) -> Result<Tunnel> {
    let _guard = self.lock_for(&tunnel.id).await;
    let existing = self
      .store
      .get_tunnel(&tunnel.id)
      .await
      .ok_or_else(|| OrchestratorError::NotFound(format!("tunnel {}", tunnel.id)))?;
    let spec_changed = existing.spec != tunnel.spec
      || existing.core != tunnel.core
      || existing.kind != tunnel.kind
      || existing.iran_node_id != tunnel.iran_node_id
      || existing.foreign_node_id != tunnel.foreign_node_id;
    tunnel.created_at = existing.created_at;
    tunnel.revision = existing.revision + 1;
    tunnel.updated_at = chrono::Utc::now();
    self.normalize_and_validate(&mut tunnel).await?;
    self.store.put_tunnel(tunnel.clone()).await;

    if spec_changed {
      self.apply_tunnel_inner(&tunnel.id).await?;
      return self
        .store
        .get_tunnel(&tunnel.id)
        .await
        .ok_or_else(|| OrchestratorError::NotFound(format!("tunnel {}", tunnel.id)));
    }
    Ok(tunnel)
  }

  async fn normalize_and_validate(&self, tunnel: &mut Tunnel) -> Result<()> {
    let ports = match tunnel.spec.get("ports") {
      Some(v) => parse_ports(v)?,
      None => Vec::new(),
    };
    normalize_spec_ports(tunnel, &ports);

    let iran = match &tunnel.iran_node_id {
      Some(id) => Some(self.resolve_node(id).await?),
      None => None,
    };
    let foreign = match &tunnel.foreign_node_id {
      Some(id) => Some(self.resolve_node(id).await?),
      None => None,
    };
    Self::validate_roles(tunnel.core, iran.as_ref(), foreign.as_ref())
  }

  pub async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()> {
    let _guard = self.lock_for(tunnel_id).await;
    let tunnel = self
      .store
      .get_tunnel(tunnel_id)
      .await
      .ok_or_else(|| OrchestratorError::NotFound(format!("tunnel {tunnel_id}")))?;

    let (iran, foreign) = self.fetch_endpoint_nodes(&tunnel).await?;
    let derived = derive_tunnel_specs(&tunnel, iran.as_ref(), foreign.as_ref(), self.panel_api_port, &self.panel_host_hint)?;

    if let Some(server) = &derived.server {
      self.remove_endpoint(tunnel_id, tunnel.core, server).await;
    }
    if let Some(client) = &derived.client {
      self.remove_endpoint(tunnel_id, tunnel.core, client).await;
    }

    self.store.delete_tunnel(tunnel_id).await;
    Ok(())
  }

  async fn fetch_endpoint_nodes(&self, tunnel: &Tunnel) -> Result<(Option<Node>, Option<Node>)> {
    let iran = match &tunnel.iran_node_id {
      Some(id) => Some(self.resolve_node(id).await?),
      None => None,
    };
    let foreign = match &tunnel.foreign_node_id {
      Some(id) => Some(self.resolve_node(id).await?),
      None => None,
    };
    Ok((iran, foreign))
  }

  /// ApplyTunnel: render both mirrored endpoints and materialize them,
  /// iran/server side first, foreign/client side second. On a second-side
  /// failure, best-effort compensate by removing the first side so repeated
  /// apply attempts don't leak half-applied engines.
  pub async fn apply_tunnel(&self, tunnel_id: &str) -> Result<()> {
    let _guard = self.lock_for(tunnel_id).await;
    let span = tracing::info_span!("apply_tunnel", tunnel_id);
    self.apply_tunnel_inner(tunnel_id).instrument(span).await
  }

  async fn apply_tunnel_inner(&self, tunnel_id: &str) -> Result<()> {
    let mut tunnel = self
      .store
      .get_tunnel(tunnel_id)
      .await
      .ok_or_else(|| OrchestratorError::NotFound(format!("tunnel {tunnel_id}")))?;

    if tunnel.quota_mb > 0.0 && tunnel.used_mb >= tunnel.quota_mb {
      let now = chrono::Utc::now();
      tunnel.mark_error("quota exceeded", now);
      self.store.put_tunnel(tunnel.clone()).await;
      return Err(OrchestratorError::QuotaExceeded);
    }

    let (iran, foreign) = self.fetch_endpoint_nodes(&tunnel).await?;
    let derived = derive_tunnel_specs(&tunnel, iran.as_ref(), foreign.as_ref(), self.panel_api_port, &self.panel_host_hint)?;

    let result = self.materialize(tunnel_id, tunnel.core, &derived.server, &derived.client).await;

    let now = chrono::Utc::now();
    match &result {
      Ok(()) => tunnel.mark_active(now),
      Err(e) => {
        if e.persists_as_error_status() {
          tunnel.mark_error(e.to_string(), now);
        }
      }
    }
    self.store.put_tunnel(tunnel).await;
    result
  }

  async fn materialize(
    &self,
    tunnel_id: &str,
    core: Core,
    server: &Option<EndpointSpec>,
    client: &Option<EndpointSpec>,
  ) -> Result<()> {
    let mut applied_server = false;
    if let Some(server) = server {
      self.apply_endpoint(tunnel_id, core, server).await?;
      applied_server = true;
    }
    if let Some(client) = client {
      if let Err(e) = self.apply_endpoint(tunnel_id, core, client).await {
        if applied_server {
          tracing::warn!(tunnel_id, "client side failed to apply, rolling back server side");
          self.remove_endpoint(tunnel_id, core, server.as_ref().unwrap()).await;
        }
        return Err(e);
      }
    }
    Ok(())
  }

  async fn apply_endpoint(&self, tunnel_id: &str, core: Core, endpoint: &EndpointSpec) -> Result<()> {
    let adapter = adapter_for(core);
    let rendered = adapter.render(tunnel_id, endpoint)?;

    match &endpoint.target {
      EndpointTarget::Panel => {
        if let Some((path, contents)) = &rendered.config_file {
          if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
              .await
              .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("failed to create config dir: {e}")))?;
          }
          tokio::fs::write(path, contents)
            .await
            .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("failed to write config {path:?}: {e}")))?;
        }
        self
          .local_supervisor
          .spawn(tunnel_id, rendered.argv, rendered.env, log_path(core, tunnel_id))
          .await?;
        if let Some(target) = rendered.counter_target {
          self.local_accountant.install(tunnel_id, target).await?;
        }
        Ok(())
      }
      EndpointTarget::Node(node_id) => {
        let node = self.resolve_node(node_id).await?;
        let endpoint_addr = Self::node_endpoint(&node)?;
        let request = ApplyTunnelRequest {
          tunnel_id: tunnel_id.to_string(),
          core,
          argv: rendered.argv,
          env: rendered.env,
          config_file: rendered.config_file.map(|(path, contents)| ConfigFilePayload {
            path: path.to_string_lossy().into_owned(),
            contents,
          }),
          counter_target: rendered.counter_target.map(Into::into),
        };
        self
          .rpc
          .apply_tunnel(&endpoint_addr, request)
          .await
          .map(|_| ())
          .map_err(|e| match e {
            OrchestratorError::Internal(inner) => OrchestratorError::NodeUnreachable(inner.to_string()),
            other => other,
          })
      }
    }
  }

  async fn remove_endpoint(&self, tunnel_id: &str, _core: Core, endpoint: &EndpointSpec) {
    match &endpoint.target {
      EndpointTarget::Panel => {
        let _ = self.local_supervisor.stop(tunnel_id, STOP_GRACE).await;
        self.local_accountant.remove(tunnel_id).await;
      }
      EndpointTarget::Node(node_id) => {
        let Ok(node) = self.resolve_node(node_id).await else { return };
        let Ok(endpoint_addr) = Self::node_endpoint(&node) else { return };
        if let Err(e) = self
          .rpc
          .remove_tunnel(
            &endpoint_addr,
            RemoveTunnelRequest {
              tunnel_id: tunnel_id.to_string(),
            },
          )
          .await
        {
          tracing::warn!(tunnel_id, node_id, error = %e, "failed to remove remote tunnel (non-fatal)");
        }
      }
    }
  }

  /// Restoration loop / auto-reapply driver: apply every persisted tunnel,
  /// returning per-tunnel outcomes so the caller can log and continue past
  /// individual failures rather than aborting the whole pass.
  pub async fn reapply_all(&self) -> Vec<(TunnelId, Result<()>)> {
    let tunnels = self.store.list_tunnels().await;
    let mut results = Vec::with_capacity(tunnels.len());
    for tunnel in tunnels {
      let result = self.apply_tunnel(&tunnel.id).await;
      if let Err(e) = &result {
        tracing::warn!(tunnel_id = %tunnel.id, error = %e, "reapply failed for tunnel");
      }
      results.push((tunnel.id, result));
    }
    results
  }

  pub async fn get_status(&self, tunnel_id: &str) -> Result<TunnelStatusView> {
    let tunnel = self
      .store
      .get_tunnel(tunnel_id)
      .await
      .ok_or_else(|| OrchestratorError::NotFound(format!("tunnel {tunnel_id}")))?;

    let (iran, foreign) = self.fetch_endpoint_nodes(&tunnel).await?;
    let derived = derive_tunnel_specs(&tunnel, iran.as_ref(), foreign.as_ref(), self.panel_api_port, &self.panel_host_hint)?;

    let server_running = match &derived.server {
      Some(e) => Some(self.endpoint_running(tunnel_id, e).await),
      None => None,
    };
    let client_running = match &derived.client {
      Some(e) => Some(self.endpoint_running(tunnel_id, e).await),
      None => None,
    };

    Ok(TunnelStatusView {
      tunnel,
      server_running,
      client_running,
    })
  }

  async fn endpoint_running(&self, tunnel_id: &str, endpoint: &EndpointSpec) -> bool {
    match &endpoint.target {
      EndpointTarget::Panel => self.local_supervisor.is_running(tunnel_id).await,
      EndpointTarget::Node(node_id) => {
        let Ok(node) = self.resolve_node(node_id).await else { return false };
        let Ok(endpoint_addr) = Self::node_endpoint(&node) else { return false };
        self
          .rpc
          .tunnel_status(&endpoint_addr, tunnel_id)
          .await
          .map(|s| s.process_running)
          .unwrap_or(false)
      }
    }
  }

  /// Apply a usage reading reported by a node (or gathered locally for
  /// panel-hosted endpoints). Enforces monotonic usage via `Tunnel::record_usage`.
  pub async fn push_usage(&self, tunnel_id: &str, node_id: Option<&str>, reported_mb: f64) -> Result<()> {
    let _guard = self.lock_for(tunnel_id).await;
    let mut tunnel = self
      .store
      .get_tunnel(tunnel_id)
      .await
      .ok_or_else(|| OrchestratorError::NotFound(format!("tunnel {tunnel_id}")))?;

    let now = chrono::Utc::now();
    tunnel.record_usage(reported_mb, now);
    self
      .store
      .append_usage(UsageRecord {
        tunnel_id: tunnel_id.to_string(),
        node_id: node_id.map(str::to_string),
        bytes: (reported_mb * 1024.0 * 1024.0) as u64,
        timestamp: now,
      })
      .await;
    let became_error = tunnel.status == TunnelStatus::Error;
    self.store.put_tunnel(tunnel).await;

    if became_error {
      return Err(OrchestratorError::QuotaExceeded);
    }
    Ok(())
  }

  pub async fn list_nodes(&self) -> Vec<Node> {
    self.store.list_nodes().await
  }

  pub async fn list_tunnels(&self) -> Vec<Tunnel> {
    self.store.list_tunnels().await
  }

  pub async fn get_settings(&self) -> Settings {
    self.store.get_settings().await
  }

  pub async fn put_settings(&self, settings: Settings) {
    self.store.put_settings(settings).await
  }
}
