//! `chisel`: argv-only, no config file. The server half always runs on the
//! panel (see [`crate::derive::derive_tunnel_specs`]); the client half runs
//! on the foreign node and requests one `R:` (reverse) remote per port,
//! opening the public listener on the server and forwarding back to the
//! client's local service.

use super::{resolve_binary, CoreAdapter, RenderedEngine};
use crate::accountant::CounterTarget;
use crate::derive::{EndpointMode, EndpointSpec};
use crate::error::{OrchestratorError, Result};

pub struct ChiselAdapter;

fn auth_arg(endpoint: &EndpointSpec) -> Option<String> {
  endpoint
    .extra
    .get("auth")
    .and_then(serde_json::Value::as_str)
    .map(str::to_string)
}

/// A fingerprint pins the server's SSH key seed so it survives restarts
/// instead of chisel minting a fresh one each time.
fn fingerprint_arg(endpoint: &EndpointSpec) -> Option<String> {
  endpoint
    .extra
    .get("fingerprint")
    .and_then(serde_json::Value::as_str)
    .map(str::to_string)
}

fn wants_ipv6(endpoint: &EndpointSpec) -> bool {
  endpoint.extra.get("use_ipv6").and_then(serde_json::Value::as_bool).unwrap_or(false)
}

impl CoreAdapter for ChiselAdapter {
  fn render(&self, _tunnel_id: &str, endpoint: &EndpointSpec) -> Result<RenderedEngine> {
    match endpoint.mode {
      EndpointMode::Server => {
        let bind_addr = endpoint
          .bind_addr
          .clone()
          .ok_or_else(|| OrchestratorError::Internal(anyhow::anyhow!("server endpoint missing bind_addr")))?;
        let (_, port, is_ipv6) = super::parse_address_port(&bind_addr)
          .ok_or_else(|| OrchestratorError::Validation(format!("invalid chisel bind_addr: {bind_addr}")))?;

        let mut argv = vec![resolve_binary("CHISEL_BINARY", "chisel"), "server".into(), "--port".into(), port.to_string(), "--reverse".into()];
        if wants_ipv6(endpoint) {
          argv.push("--host".into());
          argv.push("::".into());
        }
        if let Some(auth) = auth_arg(endpoint) {
          argv.push("--auth".into());
          argv.push(auth);
        }
        if let Some(fingerprint) = fingerprint_arg(endpoint) {
          argv.push("--key".into());
          argv.push(fingerprint);
        }

        Ok(RenderedEngine {
          argv,
          env: vec![],
          config_file: None,
          counter_target: Some(CounterTarget::Local { port, is_ipv6 }),
        })
      }
      EndpointMode::Client => {
        let remote_addr = endpoint
          .remote_addr
          .clone()
          .ok_or_else(|| OrchestratorError::Internal(anyhow::anyhow!("client endpoint missing remote_addr")))?;

        if endpoint.ports.is_empty() {
          return Err(OrchestratorError::Validation("chisel requires at least one port".into()));
        }

        let mut argv = vec![resolve_binary("CHISEL_BINARY", "chisel"), "client".into()];
        if let Some(auth) = auth_arg(endpoint) {
          argv.push("--auth".into());
          argv.push(auth);
        }
        argv.push(remote_addr.clone());
        let reverse_bind = if wants_ipv6(endpoint) { "::" } else { "0.0.0.0" };
        for port in &endpoint.ports {
          let host = port.target_host.as_deref().unwrap_or("127.0.0.1");
          argv.push(format!("R:{reverse_bind}:{}:{}:{}", port.local, host, port.remote));
        }

        let counter_target = super::parse_address_port(&remote_addr).map(|(host, port, is_ipv6)| CounterTarget::Remote {
          host,
          port,
          is_ipv6,
        });

        Ok(RenderedEngine {
          argv,
          env: vec![],
          config_file: None,
          counter_target,
        })
      }
    }
  }
}
