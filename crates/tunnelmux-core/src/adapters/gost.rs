//! `gost`: argv-only port forwarder, one `-L`/`-F` pair per port. Always
//! rendered in [`crate::derive::EndpointMode::Server`] — gost has no
//! separate client process, it just forwards.

use super::{resolve_binary, CoreAdapter, RenderedEngine};
use crate::accountant::CounterTarget;
use crate::derive::EndpointSpec;
use crate::error::{OrchestratorError, Result};
use crate::ports::PortMapping;

pub struct GostAdapter;

/// `-L` listens as the tunnel's own type; `-F` forwards over tcp except for
/// udp, which must forward over udp too.
fn schemes(kind: &str) -> Result<(&str, &str)> {
  match kind {
    "tcp" => Ok(("tcp", "tcp")),
    "udp" => Ok(("udp", "udp")),
    "ws" => Ok(("ws", "tcp")),
    "grpc" => Ok(("grpc", "tcp")),
    other => Err(OrchestratorError::Validation(format!("unsupported gost tunnel type: {other}"))),
  }
}

/// `forward_to` is an explicit `host:port` override applied to every port;
/// absent that, each port forwards to its own `target_host` (or the spec's
/// `remote_ip`) on its own remote port.
fn forward_target(endpoint: &EndpointSpec, port: &PortMapping) -> String {
  if let Some(forward_to) = endpoint.extra.get("forward_to").and_then(serde_json::Value::as_str) {
    return forward_to.to_string();
  }
  let host = port
    .target_host
    .as_deref()
    .or_else(|| endpoint.extra.get("remote_ip").and_then(serde_json::Value::as_str))
    .unwrap_or("127.0.0.1");
  format!("{host}:{}", port.remote)
}

impl CoreAdapter for GostAdapter {
  fn render(&self, _tunnel_id: &str, endpoint: &EndpointSpec) -> Result<RenderedEngine> {
    if endpoint.ports.is_empty() {
      return Err(OrchestratorError::Validation("gost requires at least one port".into()));
    }
    let (listen_scheme, forward_scheme) = schemes(&endpoint.kind)?;

    let mut argv = vec![resolve_binary("GOST_BINARY", "gost")];
    let mut first_port = None;
    for port in &endpoint.ports {
      let forward = forward_target(endpoint, port);
      argv.push(format!("-L={listen_scheme}://:{}", port.local));
      argv.push(format!("-F={forward_scheme}://{forward}"));
      first_port.get_or_insert(port.local);
    }

    Ok(RenderedEngine {
      argv,
      env: vec![],
      config_file: None,
      counter_target: first_port.map(|port| CounterTarget::Local { port, is_ipv6: false }),
    })
  }
}
