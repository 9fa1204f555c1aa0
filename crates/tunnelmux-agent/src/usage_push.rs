//! Background task: periodically samples usage for every tunnel this agent
//! is running and pushes it to the panel, so the panel's quota enforcement
//! sees fresh numbers even between panel-initiated polls.

use std::sync::Arc;
use std::time::Duration;

use tunnelmux_core::rpc::{UsagePushRequest, UsageReading};

use crate::state::AppState;

pub fn spawn(state: Arc<AppState>, panel_base_url: String, interval: Duration) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      if let Err(e) = push_once(&client, &state, &panel_base_url).await {
        tracing::warn!(error = %e, "usage push failed, will retry next tick");
      }
    }
  })
}

async fn push_once(client: &reqwest::Client, state: &AppState, panel_base_url: &str) -> anyhow::Result<()> {
  let ids: Vec<String> = state.tunnels.lock().await.keys().cloned().collect();
  if ids.is_empty() {
    return Ok(());
  }

  let mut readings = Vec::with_capacity(ids.len());
  for tunnel_id in ids {
    let pid = state.supervisor.pid(&tunnel_id).await;
    let used_mb = state.accountant.read_usage_mb(&tunnel_id, pid).await?;
    readings.push(UsageReading { tunnel_id, used_mb });
  }

  let request = UsagePushRequest {
    node_id: state.node_id.clone(),
    readings,
  };

  let url = format!("{}/panel/usage/push", panel_base_url.trim_end_matches('/'));
  client.post(url).json(&request).send().await?.error_for_status()?;
  Ok(())
}
