//! Agent configuration: parsed from environment variables at startup, no
//! config file or config-management crate — matches the ambient style used
//! throughout `tunnelmux-core` (env-driven binary resolution, env-driven
//! config roots).

use std::net::SocketAddr;
use std::time::Duration;

pub struct AgentConfig {
  pub node_id: String,
  pub bind_addr: SocketAddr,
  pub panel_base_url: Option<String>,
  pub usage_push_interval: Duration,
  pub stop_grace: Duration,
}

impl AgentConfig {
  pub fn from_env() -> anyhow::Result<Self> {
    let node_id = std::env::var("TUNNELMUX_NODE_ID")
      .map_err(|_| anyhow::anyhow!("TUNNELMUX_NODE_ID must be set to this node's id"))?;

    let bind_addr = std::env::var("TUNNELMUX_AGENT_BIND_ADDR")
      .unwrap_or_else(|_| "0.0.0.0:8888".to_string())
      .parse()
      .map_err(|e| anyhow::anyhow!("invalid TUNNELMUX_AGENT_BIND_ADDR: {e}"))?;

    let panel_base_url = std::env::var("TUNNELMUX_PANEL_URL").ok().filter(|s| !s.is_empty());

    let usage_push_interval = std::env::var("TUNNELMUX_USAGE_PUSH_INTERVAL_SECS")
      .ok()
      .and_then(|s| s.parse::<u64>().ok())
      .map(Duration::from_secs)
      .unwrap_or_else(|| Duration::from_secs(30));

    let stop_grace = std::env::var("TUNNELMUX_STOP_GRACE_SECS")
      .ok()
      .and_then(|s| s.parse::<u64>().ok())
      .map(Duration::from_secs)
      .unwrap_or_else(|| Duration::from_secs(5));

    Ok(Self {
      node_id,
      bind_addr,
      panel_base_url,
      usage_push_interval,
      stop_grace,
    })
  }
}
