//! Panel configuration: environment-variable driven (`PANEL_PORT`/
//! `PANEL_HOST`, `PANEL_PUBLIC_IP`/`PANEL_IP`).

use std::net::SocketAddr;
use std::time::Duration;

pub struct PanelConfig {
  pub bind_addr: SocketAddr,
  pub panel_api_port: u16,
  pub panel_public_ip: Option<String>,
  pub reapply_poll_interval: Duration,
}

impl PanelConfig {
  pub fn from_env() -> anyhow::Result<Self> {
    let host = std::env::var("PANEL_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PANEL_PORT")
      .ok()
      .and_then(|s| s.parse().ok())
      .unwrap_or(8000);
    let bind_addr: SocketAddr = format!("{host}:{port}")
      .parse()
      .map_err(|e| anyhow::anyhow!("invalid PANEL_HOST/PANEL_PORT: {e}"))?;

    let panel_public_ip = std::env::var("PANEL_PUBLIC_IP")
      .or_else(|_| std::env::var("PANEL_IP"))
      .ok()
      .filter(|s| !s.is_empty());

    Ok(Self {
      bind_addr,
      panel_api_port: port,
      panel_public_ip,
      reapply_poll_interval: Duration::from_secs(60),
    })
  }
}
