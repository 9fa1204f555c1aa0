//! Node agent RPC contract: the JSON wire types exchanged between the
//! panel and a node agent, plus [`NodeRpcClient`], the trait-object seam a
//! transport (an HTTP client in `tunnelmux-panel`, an in-process stub in
//! tests) implements. Endpoints:
//!
//! - `POST /agent/tunnels/apply`
//! - `POST /agent/tunnels/remove`
//! - `GET  /agent/tunnels/status`
//! - `GET  /agent/status`
//! - `POST /panel/usage/push` (node -> panel, inverse direction)

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Core, TunnelId};
use crate::supervisor::ProcessState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyTunnelRequest {
  pub tunnel_id: TunnelId,
  pub core: Core,
  pub argv: Vec<String>,
  pub env: Vec<(String, String)>,
  pub config_file: Option<ConfigFilePayload>,
  pub counter_target: Option<CounterTargetPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFilePayload {
  pub path: String,
  pub contents: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CounterTargetPayload {
  Local { port: u16, is_ipv6: bool },
  Remote { host: String, port: u16, is_ipv6: bool },
}

impl From<crate::accountant::CounterTarget> for CounterTargetPayload {
  fn from(target: crate::accountant::CounterTarget) -> Self {
    match target {
      crate::accountant::CounterTarget::Local { port, is_ipv6 } => Self::Local { port, is_ipv6 },
      crate::accountant::CounterTarget::Remote { host, port, is_ipv6 } => Self::Remote { host, port, is_ipv6 },
    }
  }
}

impl From<CounterTargetPayload> for crate::accountant::CounterTarget {
  fn from(payload: CounterTargetPayload) -> Self {
    match payload {
      CounterTargetPayload::Local { port, is_ipv6 } => Self::Local { port, is_ipv6 },
      CounterTargetPayload::Remote { host, port, is_ipv6 } => Self::Remote { host, port, is_ipv6 },
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyTunnelResponse {
  pub tunnel_id: TunnelId,
  pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveTunnelRequest {
  pub tunnel_id: TunnelId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatusResponse {
  pub tunnel_id: TunnelId,
  pub process_running: bool,
  pub state: RemoteProcessState,
  pub used_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProcessState {
  Starting,
  Running,
  Failed,
  Stopped,
}

impl From<ProcessState> for RemoteProcessState {
  fn from(state: ProcessState) -> Self {
    match state {
      ProcessState::Starting => Self::Starting,
      ProcessState::Running => Self::Running,
      ProcessState::Failed => Self::Failed,
      ProcessState::Stopped => Self::Stopped,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusResponse {
  pub node_id: String,
  pub tunnels: Vec<TunnelStatusResponse>,
  pub agent_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePushRequest {
  pub node_id: String,
  pub readings: Vec<UsageReading>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReading {
  pub tunnel_id: TunnelId,
  pub used_mb: f64,
}

/// What the panel needs to reach a node: derived from `Node::api_address()`.
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
  pub node_id: String,
  pub base_url: String,
}

/// The panel's view of a node agent. Implemented over `reqwest` in
/// `tunnelmux-panel`; an in-process fake backs orchestrator tests.
pub trait NodeRpcClient: Send + Sync {
  fn apply_tunnel(&self, node: &NodeEndpoint, request: ApplyTunnelRequest) -> BoxFuture<'_, Result<ApplyTunnelResponse>>;
  fn remove_tunnel(&self, node: &NodeEndpoint, request: RemoveTunnelRequest) -> BoxFuture<'_, Result<()>>;
  fn tunnel_status(&self, node: &NodeEndpoint, tunnel_id: &str) -> BoxFuture<'_, Result<TunnelStatusResponse>>;
  fn node_status(&self, node: &NodeEndpoint) -> BoxFuture<'_, Result<NodeStatusResponse>>;
}
