//! `status`/`update`/`restart`/`edit`/`edit-env`/`logs`: a non-containerized
//! take on the same operator workflow a `docker compose`-wrapping CLI gives
//! you. `systemctl` stands in for `docker compose up/pull/rm`; `journalctl`
//! stands in for `docker compose logs`; editing the unit file and its
//! `EnvironmentFile=` stands in for editing `docker-compose.yml`/`.env`.

use std::process::Command;

use serde_json::Value;

use crate::config::CliConfig;

fn editor() -> String {
  std::env::var("EDITOR").unwrap_or_else(|_| "nano".to_string())
}

fn run(cmd: &str, args: &[&str]) -> anyhow::Result<()> {
  let status = Command::new(cmd).args(args).status()?;
  if !status.success() {
    anyhow::bail!("{cmd} {} exited with {status}", args.join(" "));
  }
  Ok(())
}

pub fn status(config: &CliConfig) -> anyhow::Result<()> {
  println!("Panel Status:");
  println!("{}", "-".repeat(50));

  let active = Command::new("systemctl")
    .args(["is-active", &config.systemd_unit])
    .output()
    .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
    .unwrap_or_else(|_| "unknown".to_string());
  println!("systemd: {active}");

  let client = reqwest::blocking::Client::builder().timeout(std::time::Duration::from_secs(2)).build()?;
  match client.get(format!("{}/panel/status", config.panel_base_url)).send() {
    Ok(response) if response.status().is_success() => match response.json::<Value>() {
      Ok(body) => {
        let nodes = body.get("nodes").and_then(Value::as_array).map(Vec::len).unwrap_or(0);
        let tunnels = body.get("tunnels").and_then(Value::as_array).map(Vec::len).unwrap_or(0);
        let active_tunnels = body
          .get("tunnels")
          .and_then(Value::as_array)
          .map(|t| t.iter().filter(|tunnel| tunnel.get("status").and_then(Value::as_str) == Some("active")).count())
          .unwrap_or(0);
        println!("API: running");
        println!("Nodes: {nodes} registered");
        println!("Tunnels: {active_tunnels}/{tunnels} active");
      }
      Err(_) => println!("API: responding but returned an unreadable body"),
    },
    Ok(response) => println!("API: not responding (status {})", response.status()),
    Err(e) => println!("API: not accessible ({e})"),
  }
  Ok(())
}

pub fn update(config: &CliConfig) -> anyhow::Result<()> {
  println!("Updating panel...");
  run("systemctl", &["daemon-reload"])?;
  run("systemctl", &["restart", &config.systemd_unit])?;
  println!("Panel updated.");
  Ok(())
}

pub fn restart(config: &CliConfig) -> anyhow::Result<()> {
  println!("Restarting panel...");
  run("systemctl", &["restart", &config.systemd_unit])?;
  println!("Panel restarted. Tunnels are preserved.");
  Ok(())
}

pub fn edit(config: &CliConfig) -> anyhow::Result<()> {
  run(&editor(), &[&config.unit_file().to_string_lossy()])
}

pub fn edit_env(config: &CliConfig) -> anyhow::Result<()> {
  let env_file = config.env_file();
  if !env_file.exists() {
    if let Some(parent) = env_file.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&env_file, "")?;
  }
  run(&editor(), &[&env_file.to_string_lossy()])
}

pub fn logs(config: &CliConfig, follow: bool) -> anyhow::Result<()> {
  let mut args = vec!["-u", config.systemd_unit.as_str()];
  if follow {
    args.push("-f");
  }
  run("journalctl", &args)
}
