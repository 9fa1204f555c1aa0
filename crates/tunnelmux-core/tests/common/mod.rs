//! Fakes backing the end-to-end scenario tests: an in-process `NodeRpcClient`
//! that records what the orchestrator would have shipped to a real agent,
//! plus a `Supervisor`/`Accountant` pair that track state without touching a
//! real process or packet filter. No test in this crate spawns a real
//! tunnel engine binary or calls into iptables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;

use tunnelmux_core::accountant::{Accountant, CounterTarget};
use tunnelmux_core::error::Result;
use tunnelmux_core::rpc::{
  ApplyTunnelRequest, ApplyTunnelResponse, NodeEndpoint, NodeRpcClient, NodeStatusResponse, RemoteProcessState,
  RemoveTunnelRequest, TunnelStatusResponse,
};
use tunnelmux_core::supervisor::{ProbeStatus, ProcessState, Supervisor};

/// What a fake node recorded for one applied tunnel: enough to assert on
/// argv/config contents without a real agent decoding them.
#[derive(Debug, Clone)]
pub struct RecordedApply {
  pub node_id: String,
  pub request: ApplyTunnelRequest,
}

#[derive(Default)]
struct FakeRpcState {
  applied: HashMap<String, RecordedApply>,
}

/// In-process stand-in for `ReqwestNodeRpcClient`: every "node" is just a
/// key in a map, reached without any real HTTP.
#[derive(Default)]
pub struct FakeNodeRpcClient {
  state: Mutex<FakeRpcState>,
}

impl FakeNodeRpcClient {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn applied_to(&self, node_id: &str) -> Option<RecordedApply> {
    self.state.lock().await.applied.get(node_id).cloned()
  }
}

impl NodeRpcClient for FakeNodeRpcClient {
  fn apply_tunnel(&self, node: &NodeEndpoint, request: ApplyTunnelRequest) -> BoxFuture<'_, Result<ApplyTunnelResponse>> {
    let node_id = node.node_id.clone();
    async move {
      let tunnel_id = request.tunnel_id.clone();
      self.state.lock().await.applied.insert(
        node_id,
        RecordedApply {
          node_id: node.node_id.clone(),
          request,
        },
      );
      Ok(ApplyTunnelResponse { tunnel_id, pid: Some(4242) })
    }
    .boxed()
  }

  fn remove_tunnel(&self, node: &NodeEndpoint, _request: RemoveTunnelRequest) -> BoxFuture<'_, Result<()>> {
    let node_id = node.node_id.clone();
    async move {
      self.state.lock().await.applied.remove(&node_id);
      Ok(())
    }
    .boxed()
  }

  fn tunnel_status(&self, node: &NodeEndpoint, tunnel_id: &str) -> BoxFuture<'_, Result<TunnelStatusResponse>> {
    let node_id = node.node_id.clone();
    let tunnel_id = tunnel_id.to_string();
    async move {
      let guard = self.state.lock().await;
      let running = guard
        .applied
        .get(&node_id)
        .map(|a| a.request.tunnel_id == tunnel_id)
        .unwrap_or(false);
      Ok(TunnelStatusResponse {
        tunnel_id,
        process_running: running,
        state: if running { RemoteProcessState::Running } else { RemoteProcessState::Stopped },
        used_mb: 0.0,
      })
    }
    .boxed()
  }

  fn node_status(&self, node: &NodeEndpoint) -> BoxFuture<'_, Result<NodeStatusResponse>> {
    let node_id = node.node_id.clone();
    async move {
      Ok(NodeStatusResponse {
        node_id,
        tunnels: Vec::new(),
        agent_version: "test".to_string(),
      })
    }
    .boxed()
  }
}

#[derive(Debug, Clone)]
pub struct RecordedSpawn {
  pub argv: Vec<String>,
  pub env: Vec<(String, String)>,
  pub log_path: PathBuf,
}

/// Records spawns/stops without touching a real process, mirroring
/// `ChildSupervisor`'s state machine closely enough for the orchestrator's
/// materialize/remove paths to behave the same as against the real thing.
#[derive(Default)]
pub struct FakeSupervisor {
  running: Mutex<HashMap<String, RecordedSpawn>>,
}

impl FakeSupervisor {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn spawned(&self, id: &str) -> Option<RecordedSpawn> {
    self.running.lock().await.get(id).cloned()
  }
}

impl Supervisor for FakeSupervisor {
  fn spawn(&self, id: &str, argv: Vec<String>, env: Vec<(String, String)>, log_path: PathBuf) -> BoxFuture<'_, Result<()>> {
    let id = id.to_string();
    async move {
      self.running.lock().await.insert(id, RecordedSpawn { argv, env, log_path });
      Ok(())
    }
    .boxed()
  }

  fn stop(&self, id: &str, _grace: Duration) -> BoxFuture<'_, Result<()>> {
    let id = id.to_string();
    async move {
      self.running.lock().await.remove(&id);
      Ok(())
    }
    .boxed()
  }

  fn is_running(&self, id: &str) -> BoxFuture<'_, bool> {
    let id = id.to_string();
    async move { self.running.lock().await.contains_key(&id) }.boxed()
  }

  fn probe(&self, id: &str) -> BoxFuture<'_, ProbeStatus> {
    let id = id.to_string();
    async move {
      let running = self.running.lock().await.contains_key(&id);
      ProbeStatus {
        state: if running { ProcessState::Running } else { ProcessState::Stopped },
        process_running: running,
      }
    }
    .boxed()
  }

  fn pid(&self, _id: &str) -> BoxFuture<'_, Option<u32>> {
    async { Some(4242) }.boxed()
  }
}

#[derive(Default)]
pub struct FakeAccountant {
  installed: Mutex<HashMap<String, CounterTarget>>,
}

impl FakeAccountant {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Accountant for FakeAccountant {
  fn install(&self, tunnel_id: &str, target: CounterTarget) -> BoxFuture<'_, Result<()>> {
    let tunnel_id = tunnel_id.to_string();
    async move {
      self.installed.lock().await.insert(tunnel_id, target);
      Ok(())
    }
    .boxed()
  }

  fn read_usage_mb(&self, _tunnel_id: &str, _pid: Option<u32>) -> BoxFuture<'_, Result<f64>> {
    async { Ok(0.0) }.boxed()
  }

  fn remove(&self, tunnel_id: &str) -> BoxFuture<'_, ()> {
    let tunnel_id = tunnel_id.to_string();
    async move {
      self.installed.lock().await.remove(&tunnel_id);
    }
    .boxed()
  }
}

pub fn node(id: &str, role: &str, ip: &str) -> tunnelmux_core::model::Node {
  use serde_json::json;
  use std::collections::BTreeMap;
  use tunnelmux_core::model::{Node, NodeStatus};

  let mut metadata = BTreeMap::new();
  metadata.insert("role".to_string(), json!(role));
  metadata.insert("ip_address".to_string(), json!(ip));
  metadata.insert("api_port".to_string(), json!(8888));
  Node {
    id: id.to_string(),
    name: id.to_string(),
    fingerprint: format!("fp-{id}"),
    status: NodeStatus::Active,
    metadata,
  }
}

pub fn bare_tunnel(core: tunnelmux_core::model::Core, kind: &str) -> tunnelmux_core::model::Tunnel {
  use tunnelmux_core::model::{new_id, Tunnel, TunnelStatus};

  let now = chrono::Utc::now();
  Tunnel {
    id: new_id(),
    name: "test-tunnel".to_string(),
    core,
    kind: kind.to_string(),
    node_id: None,
    iran_node_id: None,
    foreign_node_id: None,
    spec: Default::default(),
    status: TunnelStatus::Pending,
    error_message: None,
    revision: 0,
    used_mb: 0.0,
    quota_mb: 0.0,
    created_at: now,
    updated_at: now,
  }
}

pub fn new_orchestrator(
  store: Arc<dyn tunnelmux_core::store::Store>,
  rpc: Arc<FakeNodeRpcClient>,
  supervisor: Arc<FakeSupervisor>,
  accountant: Arc<FakeAccountant>,
  panel_api_port: u16,
) -> tunnelmux_core::orchestrator::PanelOrchestrator {
  tunnelmux_core::orchestrator::PanelOrchestrator::new(
    store,
    rpc,
    supervisor,
    accountant,
    panel_api_port,
    tunnelmux_core::derive::PanelHostHint::default(),
  )
}
