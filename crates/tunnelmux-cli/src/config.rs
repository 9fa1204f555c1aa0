//! Where this CLI looks for the panel it operates on: an HTTP base URL built
//! from `PANEL_PORT`, plus the on-host paths/unit name a non-containerized
//! deployment uses in place of a `docker-compose.yml`/`.env` pair.

pub struct CliConfig {
  pub panel_base_url: String,
  pub systemd_unit: String,
  pub config_dir: std::path::PathBuf,
}

impl CliConfig {
  pub fn from_env() -> Self {
    let port: u16 = std::env::var("PANEL_PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(8000);
    let panel_base_url = std::env::var("TUNNELMUX_PANEL_URL").unwrap_or_else(|_| format!("http://localhost:{port}"));
    let systemd_unit = std::env::var("TUNNELMUX_SYSTEMD_UNIT").unwrap_or_else(|_| "tunnelmux-panel".to_string());
    let config_dir = std::env::var("TUNNELMUX_CONFIG_DIR")
      .map(std::path::PathBuf::from)
      .unwrap_or_else(|_| std::path::PathBuf::from("/etc/tunnelmux"));
    Self {
      panel_base_url,
      systemd_unit,
      config_dir,
    }
  }

  pub fn env_file(&self) -> std::path::PathBuf {
    self.config_dir.join("panel.env")
  }

  pub fn unit_file(&self) -> std::path::PathBuf {
    std::path::PathBuf::from("/etc/systemd/system").join(format!("{}.service", self.systemd_unit))
  }
}
