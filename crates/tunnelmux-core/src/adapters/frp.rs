//! `frp`: TOML config (frp >= 0.52 dropped INI in favour of TOML). Server
//! half runs on the panel with a bind port and token; the client half runs
//! on the foreign node and declares one `[[proxies]]` entry per port.

use toml::value::{Array, Table, Value as TomlValue};

use super::{config_path, resolve_binary, CoreAdapter, RenderedEngine};
use crate::accountant::CounterTarget;
use crate::derive::{EndpointMode, EndpointSpec};
use crate::error::{OrchestratorError, Result};
use crate::model::Core;

pub struct FrpAdapter;

fn token(endpoint: &EndpointSpec) -> Option<String> {
  endpoint.extra.get("token").and_then(serde_json::Value::as_str).map(str::to_string)
}

/// frp proxy types are a distinct vocabulary from the tunnel's own `type`;
/// only `tcp`/`udp` map straight across, everything else rides over tcp.
fn proxy_type(kind: &str) -> &str {
  match kind {
    "udp" => "udp",
    _ => "tcp",
  }
}

impl CoreAdapter for FrpAdapter {
  fn render(&self, tunnel_id: &str, endpoint: &EndpointSpec) -> Result<RenderedEngine> {
    match endpoint.mode {
      EndpointMode::Server => {
        let bind_addr = endpoint
          .bind_addr
          .clone()
          .ok_or_else(|| OrchestratorError::Internal(anyhow::anyhow!("server endpoint missing bind_addr")))?;
        let (_, bind_port, is_ipv6) = super::parse_address_port(&bind_addr)
          .ok_or_else(|| OrchestratorError::Validation(format!("invalid frp bind_addr: {bind_addr}")))?;

        let mut root = Table::new();
        root.insert("bindAddr".into(), TomlValue::String("0.0.0.0".to_string()));
        root.insert("bindPort".into(), TomlValue::Integer(bind_port as i64));
        if let Some(t) = token(endpoint) {
          let mut auth = Table::new();
          auth.insert("method".into(), TomlValue::String("token".to_string()));
          auth.insert("token".into(), TomlValue::String(t));
          root.insert("auth".into(), TomlValue::Table(auth));
        }

        let contents = toml::to_string_pretty(&TomlValue::Table(root))
          .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("failed to render frps toml: {e}")))?;

        Ok(RenderedEngine {
          argv: vec![
            resolve_binary("FRPS_BINARY", "frps"),
            "-c".into(),
            config_path(Core::Frp, tunnel_id, "toml").to_string_lossy().into_owned(),
          ],
          env: vec![],
          config_file: Some((config_path(Core::Frp, tunnel_id, "toml"), contents)),
          counter_target: Some(CounterTarget::Local {
            port: bind_port,
            is_ipv6,
          }),
        })
      }
      EndpointMode::Client => {
        let remote_addr = endpoint
          .remote_addr
          .clone()
          .ok_or_else(|| OrchestratorError::Internal(anyhow::anyhow!("client endpoint missing remote_addr")))?;
        let (server_addr, server_port, _) = super::parse_address_port(&remote_addr)
          .ok_or_else(|| OrchestratorError::Validation(format!("invalid frp remote_addr: {remote_addr}")))?;

        let mut root = Table::new();
        root.insert("serverAddr".into(), TomlValue::String(server_addr));
        root.insert("serverPort".into(), TomlValue::Integer(server_port as i64));
        if let Some(t) = token(endpoint) {
          let mut auth = Table::new();
          auth.insert("method".into(), TomlValue::String("token".to_string()));
          auth.insert("token".into(), TomlValue::String(t));
          root.insert("auth".into(), TomlValue::Table(auth));
        }

        let mut proxies = Array::new();
        for (i, port) in endpoint.ports.iter().enumerate() {
          let mut proxy = Table::new();
          proxy.insert("name".into(), TomlValue::String(format!("{tunnel_id}_{i}")));
          proxy.insert("type".into(), TomlValue::String(proxy_type(&endpoint.kind).to_string()));
          proxy.insert(
            "localIP".into(),
            TomlValue::String(port.target_host.clone().unwrap_or_else(|| "127.0.0.1".to_string())),
          );
          proxy.insert("localPort".into(), TomlValue::Integer(port.remote as i64));
          proxy.insert("remotePort".into(), TomlValue::Integer(port.local as i64));
          proxies.push(TomlValue::Table(proxy));
        }
        root.insert("proxies".into(), TomlValue::Array(proxies));

        let contents = toml::to_string_pretty(&TomlValue::Table(root))
          .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("failed to render frpc toml: {e}")))?;

        let counter_target = super::parse_address_port(&remote_addr).map(|(host, port, is_ipv6)| CounterTarget::Remote {
          host,
          port,
          is_ipv6,
        });

        Ok(RenderedEngine {
          argv: vec![
            resolve_binary("FRPC_BINARY", "frpc"),
            "-c".into(),
            config_path(Core::Frp, tunnel_id, "toml").to_string_lossy().into_owned(),
          ],
          env: vec![],
          config_file: Some((config_path(Core::Frp, tunnel_id, "toml"), contents)),
          counter_target,
        })
      }
    }
  }
}
