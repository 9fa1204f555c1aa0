//! The panel's outbound half of the node RPC contract: a thin
//! `reqwest`-backed [`NodeRpcClient`]. Transport/decode failures come back as
//! `OrchestratorError::Internal`; the orchestrator remaps those to
//! `node_unreachable` where that distinction matters (apply), and treats them
//! as "unknown/not running" elsewhere (status polling, best-effort remove).

use futures::future::BoxFuture;
use futures::FutureExt;
use tunnelmux_core::error::{OrchestratorError, Result};
use tunnelmux_core::rpc::{
  ApplyTunnelRequest, ApplyTunnelResponse, NodeEndpoint, NodeRpcClient, NodeStatusResponse, RemoveTunnelRequest,
  TunnelStatusResponse,
};

pub struct ReqwestNodeRpcClient {
  client: reqwest::Client,
}

impl ReqwestNodeRpcClient {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("reqwest client builds with static config"),
    }
  }
}

impl Default for ReqwestNodeRpcClient {
  fn default() -> Self {
    Self::new()
  }
}

async fn send_json<T: serde::de::DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T> {
  let response = request
    .send()
    .await
    .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("node RPC transport error: {e}")))?;
  let response = response
    .error_for_status()
    .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("node RPC returned an error status: {e}")))?;
  response
    .json::<T>()
    .await
    .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("node RPC returned an undecodable body: {e}")))
}

impl NodeRpcClient for ReqwestNodeRpcClient {
  fn apply_tunnel(&self, node: &NodeEndpoint, request: ApplyTunnelRequest) -> BoxFuture<'_, Result<ApplyTunnelResponse>> {
    let url = format!("{}/agent/tunnels/apply", node.base_url);
    send_json(self.client.post(url).json(&request)).boxed()
  }

  fn remove_tunnel(&self, node: &NodeEndpoint, request: RemoveTunnelRequest) -> BoxFuture<'_, Result<()>> {
    let url = format!("{}/agent/tunnels/remove", node.base_url);
    let fut = self.client.post(url).json(&request).send();
    async move {
      fut
        .await
        .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("node RPC transport error: {e}")))?
        .error_for_status()
        .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("node RPC returned an error status: {e}")))?;
      Ok(())
    }
    .boxed()
  }

  fn tunnel_status(&self, node: &NodeEndpoint, tunnel_id: &str) -> BoxFuture<'_, Result<TunnelStatusResponse>> {
    let url = format!("{}/agent/tunnels/status/{tunnel_id}", node.base_url);
    send_json(self.client.get(url)).boxed()
  }

  fn node_status(&self, node: &NodeEndpoint) -> BoxFuture<'_, Result<NodeStatusResponse>> {
    let url = format!("{}/agent/status", node.base_url);
    send_json(self.client.get(url)).boxed()
  }
}
