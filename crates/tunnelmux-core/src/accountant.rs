//! Traffic accountant: installs packet-filter counter rules per tunnel
//! endpoint, reads cumulative byte counts, and reports monotonically
//! increasing usage in MB. Falls back to the engine process's per-process
//! I/O counters when packet-filter rules are unavailable.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterTarget {
  /// Track bytes to/from a local listening port (server-side endpoints).
  Local { port: u16, is_ipv6: bool },
  /// Track bytes to/from a remote host:port (client-side endpoints, e.g.
  /// Backhaul's client dialing out to the iran node's control port).
  Remote {
    host: String,
    port: u16,
    is_ipv6: bool,
  },
}

fn comment_tag(tunnel_id: &str) -> String {
  format!("tunnelmux:{tunnel_id}")
}

fn iptables_binary(is_ipv6: bool) -> &'static str {
  if is_ipv6 {
    "ip6tables"
  } else {
    "iptables"
  }
}

fn rule_args(target: &CounterTarget, tunnel_id: &str, chain: &str) -> Vec<String> {
  let tag = comment_tag(tunnel_id);
  match target {
    CounterTarget::Local { port, .. } => vec![
      chain.to_string(),
      "-p".into(),
      "tcp".into(),
      if chain == "INPUT" { "--dport" } else { "--sport" }.to_string(),
      port.to_string(),
      "-m".into(),
      "comment".into(),
      "--comment".into(),
      tag,
      "-j".into(),
      "RETURN".into(),
    ],
    CounterTarget::Remote { host, port, .. } => vec![
      chain.to_string(),
      "-p".into(),
      "tcp".into(),
      if chain == "OUTPUT" { "-d" } else { "-s" }.to_string(),
      host.clone(),
      if chain == "OUTPUT" { "--dport" } else { "--sport" }.to_string(),
      port.to_string(),
      "-m".into(),
      "comment".into(),
      "--comment".into(),
      tag,
      "-j".into(),
      "RETURN".into(),
    ],
  }
}

fn is_ipv6_of(target: &CounterTarget) -> bool {
  match target {
    CounterTarget::Local { is_ipv6, .. } => *is_ipv6,
    CounterTarget::Remote { is_ipv6, .. } => *is_ipv6,
  }
}

async fn run_iptables(is_ipv6: bool, action: &str, rule: &[String]) -> anyhow::Result<()> {
  let mut args = vec![action.to_string()];
  args.extend(rule.iter().cloned());
  let status = Command::new(iptables_binary(is_ipv6))
    .args(&args)
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .status()
    .await?;
  if !status.success() {
    anyhow::bail!("{} {:?} exited with {status}", iptables_binary(is_ipv6), args);
  }
  Ok(())
}

async fn read_counter_bytes(is_ipv6: bool, tunnel_id: &str, chain: &str) -> u64 {
  let output = Command::new(iptables_binary(is_ipv6))
    .args(["-L", chain, "-v", "-x", "-n"])
    .output()
    .await;
  let Ok(output) = output else { return 0 };
  let text = String::from_utf8_lossy(&output.stdout);
  let tag = comment_tag(tunnel_id);
  for line in text.lines() {
    if line.contains(&tag) {
      // iptables -v -x output: pkts bytes target prot opt in out source destination ...
      if let Some(bytes) = line.split_whitespace().nth(1).and_then(|s| s.parse::<u64>().ok()) {
        return bytes;
      }
    }
  }
  0
}

#[derive(Clone)]
struct TrackedTunnel {
  target: CounterTarget,
  last_reported_mb: f64,
}

pub trait Accountant: Send + Sync {
  fn install(&self, tunnel_id: &str, target: CounterTarget) -> BoxFuture<'_, Result<()>>;
  fn read_usage_mb(&self, tunnel_id: &str, pid: Option<u32>) -> BoxFuture<'_, Result<f64>>;
  fn remove(&self, tunnel_id: &str) -> BoxFuture<'_, ()>;
}

/// The default accountant: packet-filter counters as the source of truth,
/// `/proc/<pid>/io` as a fallback when no packet-filter rule is tracked yet
/// (or this platform has no iptables).
pub struct PacketFilterAccountant {
  tracked: Arc<Mutex<HashMap<String, TrackedTunnel>>>,
}

impl PacketFilterAccountant {
  pub fn new() -> Self {
    Self {
      tracked: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl Default for PacketFilterAccountant {
  fn default() -> Self {
    Self::new()
  }
}

async fn process_io_bytes(pid: u32) -> Option<u64> {
  let path = format!("/proc/{pid}/io");
  let contents = tokio::fs::read_to_string(path).await.ok()?;
  let mut read_bytes = 0u64;
  let mut write_bytes = 0u64;
  for line in contents.lines() {
    if let Some(rest) = line.strip_prefix("read_bytes:") {
      read_bytes = rest.trim().parse().unwrap_or(0);
    } else if let Some(rest) = line.strip_prefix("write_bytes:") {
      write_bytes = rest.trim().parse().unwrap_or(0);
    }
  }
  Some(read_bytes + write_bytes)
}

impl Accountant for PacketFilterAccountant {
  fn install(&self, tunnel_id: &str, target: CounterTarget) -> BoxFuture<'_, Result<()>> {
    let tunnel_id = tunnel_id.to_string();
    let tracked = Arc::clone(&self.tracked);
    async move {
      let is_ipv6 = is_ipv6_of(&target);
      let ingress_chain = "INPUT";
      let egress_chain = "OUTPUT";
      for chain in [ingress_chain, egress_chain] {
        let rule = rule_args(&target, &tunnel_id, chain);
        if let Err(e) = run_iptables(is_ipv6, "-A", &rule).await {
          tracing::warn!(tunnel_id = %tunnel_id, error = %e, "failed to install packet-filter counter rule; falling back to process I/O accounting");
        }
      }
      tracked.lock().await.insert(
        tunnel_id,
        TrackedTunnel {
          target,
          last_reported_mb: 0.0,
        },
      );
      Ok(())
    }
    .boxed()
  }

  fn read_usage_mb(&self, tunnel_id: &str, pid: Option<u32>) -> BoxFuture<'_, Result<f64>> {
    let tunnel_id = tunnel_id.to_string();
    let tracked = Arc::clone(&self.tracked);
    async move {
      let mut guard = tracked.lock().await;
      let mut total_bytes: u64 = 0;

      if let Some(entry) = guard.get(&tunnel_id) {
        let is_ipv6 = is_ipv6_of(&entry.target);
        let ingress = read_counter_bytes(is_ipv6, &tunnel_id, "INPUT").await;
        let egress = read_counter_bytes(is_ipv6, &tunnel_id, "OUTPUT").await;
        total_bytes = total_bytes.max(ingress + egress);
      }

      if let Some(pid) = pid {
        if let Some(io_bytes) = process_io_bytes(pid).await {
          total_bytes = total_bytes.max(io_bytes);
        }
      }

      let current_mb = total_bytes as f64 / (1024.0 * 1024.0);
      let entry = guard.entry(tunnel_id).or_insert_with(|| TrackedTunnel {
        target: CounterTarget::Local { port: 0, is_ipv6: false },
        last_reported_mb: 0.0,
      });
      entry.last_reported_mb = entry.last_reported_mb.max(current_mb);
      Ok(entry.last_reported_mb)
    }
    .boxed()
  }

  fn remove(&self, tunnel_id: &str) -> BoxFuture<'_, ()> {
    let tunnel_id = tunnel_id.to_string();
    let tracked = Arc::clone(&self.tracked);
    async move {
      let entry = tracked.lock().await.remove(&tunnel_id);
      if let Some(entry) = entry {
        let is_ipv6 = is_ipv6_of(&entry.target);
        for chain in ["INPUT", "OUTPUT"] {
          let rule = rule_args(&entry.target, &tunnel_id, chain);
          if let Err(e) = run_iptables(is_ipv6, "-D", &rule).await {
            tracing::debug!(tunnel_id = %tunnel_id, error = %e, "failed to delete packet-filter counter rule (non-fatal)");
          }
        }
      }
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn usage_is_monotonic_even_without_a_live_packet_filter() {
    let accountant = PacketFilterAccountant::new();
    accountant
      .install("t1", CounterTarget::Local { port: 9000, is_ipv6: false })
      .await
      .unwrap();
    let first = accountant.read_usage_mb("t1", None).await.unwrap();
    let second = accountant.read_usage_mb("t1", None).await.unwrap();
    assert!(second >= first);
  }
}
