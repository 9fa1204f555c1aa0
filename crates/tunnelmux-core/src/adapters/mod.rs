//! Core adapters: one per engine kind. Each adapter translates a
//! normalized [`EndpointSpec`] into an engine-specific config file (if any)
//! and argv, and declares the packet-filter counter target the accountant
//! should install for that endpoint.

mod backhaul;
mod chisel;
mod frp;
mod gost;
mod rathole;

use std::path::PathBuf;

use crate::accountant::CounterTarget;
use crate::derive::EndpointSpec;
use crate::error::Result;
use crate::model::Core;

/// What the supervisor needs to launch an engine instance, plus what the
/// accountant needs to start counting its traffic.
pub struct RenderedEngine {
  pub argv: Vec<String>,
  pub env: Vec<(String, String)>,
  /// `(path, contents)` for config-file-based cores; `None` for argv-only
  /// cores (`chisel`, `gost`).
  pub config_file: Option<(PathBuf, String)>,
  pub counter_target: Option<CounterTarget>,
}

pub trait CoreAdapter: Send + Sync {
  fn render(&self, tunnel_id: &str, endpoint: &EndpointSpec) -> Result<RenderedEngine>;
}

pub fn adapter_for(core: Core) -> Box<dyn CoreAdapter> {
  match core {
    Core::Rathole => Box::new(rathole::RatholeAdapter),
    Core::Backhaul => Box::new(backhaul::BackhaulAdapter),
    Core::Chisel => Box::new(chisel::ChiselAdapter),
    Core::Frp => Box::new(frp::FrpAdapter),
    Core::Gost => Box::new(gost::GostAdapter),
  }
}

/// Resolve an engine's binary path: an explicit env var override, then the
/// conventional `/usr/local/bin/<name>`, then bare `PATH` lookup (left to
/// the OS at spawn time, so we just return the bare name).
pub fn resolve_binary(env_var: &str, default_name: &str) -> String {
  if let Ok(path) = std::env::var(env_var) {
    if !path.is_empty() {
      return path;
    }
  }
  let conventional = PathBuf::from("/usr/local/bin").join(default_name);
  if conventional.exists() {
    return conventional.to_string_lossy().into_owned();
  }
  default_name.to_string()
}

/// Per-core config root, overridable so agents on different hosts can keep
/// engine state under a writable prefix.
pub fn config_dir(core: Core) -> PathBuf {
  if core == Core::Backhaul {
    if let Ok(dir) = std::env::var("SMITE_BACKHAUL_CLIENT_DIR") {
      if !dir.is_empty() {
        return PathBuf::from(dir);
      }
    }
  }
  PathBuf::from("/etc/tunnelmux").join(core.as_str())
}

pub fn log_path(core: Core, tunnel_id: &str) -> PathBuf {
  config_dir(core).join(format!("{}_{}.log", core.as_str(), tunnel_id))
}

pub fn config_path(core: Core, tunnel_id: &str, extension: &str) -> PathBuf {
  config_dir(core).join(format!("{tunnel_id}.{extension}"))
}

fn is_ipv6_literal(host: &str) -> bool {
  host.contains(':') && !host.starts_with('[')
}

/// Extract `(host, port, is_ipv6)` from a bare `host:port` or bracketed
/// `[::1]:port` address, used to build counter targets for client-side
/// endpoints that track traffic by remote address.
pub(crate) fn parse_address_port(addr: &str) -> Option<(String, u16, bool)> {
  let addr = addr.strip_prefix("ws://").or_else(|| addr.strip_prefix("wss://")).unwrap_or(addr);
  if let Some(rest) = addr.strip_prefix('[') {
    let (host, rest) = rest.split_once(']')?;
    let port_str = rest.strip_prefix(':')?;
    let port = port_str.parse().ok()?;
    return Some((host.to_string(), port, true));
  }
  let (host, port_str) = addr.rsplit_once(':')?;
  let port = port_str.parse().ok()?;
  Some((host.to_string(), port, is_ipv6_literal(host)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_plain_address() {
    assert_eq!(
      parse_address_port("203.0.113.10:23333"),
      Some(("203.0.113.10".to_string(), 23333, false))
    );
  }

  #[test]
  fn parses_ws_scheme_address() {
    assert_eq!(
      parse_address_port("ws://203.0.113.10:23333"),
      Some(("203.0.113.10".to_string(), 23333, false))
    );
  }

  #[test]
  fn parses_bracketed_ipv6() {
    assert_eq!(
      parse_address_port("[2001:db8::1]:23333"),
      Some(("2001:db8::1".to_string(), 23333, true))
    );
  }
}
