//! `backhaul`: TOML client/server config. Passes a fixed allow-list of
//! tuning keys straight through from the user spec (`CLIENT_OPTION_KEYS`)
//! rather than reinventing its option surface.

use std::collections::BTreeMap;

use serde_json::Value;
use toml::value::{Table, Value as TomlValue};

use super::{config_path, parse_address_port, resolve_binary, CoreAdapter, RenderedEngine};
use crate::accountant::CounterTarget;
use crate::derive::{EndpointMode, EndpointSpec};
use crate::error::{OrchestratorError, Result};
use crate::model::Core;

pub struct BackhaulAdapter;

/// Tuning keys passed through verbatim into `[client]`/`[server]` when
/// present in the spec, alongside the mandatory connection fields.
const CLIENT_OPTION_KEYS: &[&str] = &[
  "connection_pool",
  "retry_interval",
  "nodelay",
  "keepalive_period",
  "log_level",
  "pprof",
  "mux_con",
  "mux_version",
  "mux_framesize",
  "mux_recievebuffer",
  "mux_streambuffer",
  "sniffer",
  "sniffer_log",
  "dial_timeout",
  "aggressive_pool",
  "edge_ip",
  "skip_optz",
  "mss",
  "so_rcvbuf",
  "so_sndbuf",
  "accept_udp",
  "web_port",
];

/// `transport` in the spec wins when present, otherwise fall back to the
/// tunnel's own `type`/`kind`, then plain tcp.
fn transport_str(extra: &BTreeMap<String, Value>, kind: &str) -> &'static str {
  match extra.get("transport").and_then(Value::as_str).or(Some(kind)) {
    Some("udp") => "udp",
    Some("ws") => "ws",
    Some("wsmux") => "wsmux",
    Some("tcpmux") => "tcpmux",
    _ => "tcp",
  }
}

fn insert_value(table: &mut Table, key: &str, value: &Value) {
  let toml_value = match value {
    Value::Bool(b) => TomlValue::Boolean(*b),
    Value::Number(n) if n.is_i64() => TomlValue::Integer(n.as_i64().unwrap()),
    Value::Number(n) if n.is_u64() => TomlValue::Integer(n.as_u64().unwrap() as i64),
    Value::Number(n) => TomlValue::Float(n.as_f64().unwrap_or_default()),
    Value::String(s) => TomlValue::String(s.clone()),
    _ => return,
  };
  table.insert(key.to_string(), toml_value);
}

fn apply_passthrough_options(table: &mut Table, extra: &BTreeMap<String, Value>) {
  for key in CLIENT_OPTION_KEYS {
    if let Some(v) = extra.get(*key) {
      insert_value(table, key, v);
    }
  }
}

impl CoreAdapter for BackhaulAdapter {
  fn render(&self, tunnel_id: &str, endpoint: &EndpointSpec) -> Result<RenderedEngine> {
    let transport = transport_str(&endpoint.extra, &endpoint.kind);
    let token = endpoint
      .extra
      .get("token")
      .and_then(Value::as_str)
      .map(str::to_string)
      .ok_or_else(|| OrchestratorError::Validation("backhaul requires 'token' in spec".into()))?;

    let mut root = Table::new();

    match endpoint.mode {
      EndpointMode::Server => {
        let bind_addr = endpoint
          .bind_addr
          .clone()
          .ok_or_else(|| OrchestratorError::Internal(anyhow::anyhow!("server endpoint missing bind_addr")))?;

        let mut server = Table::new();
        server.insert("bind_addr".into(), TomlValue::String(bind_addr.clone()));
        server.insert("transport".into(), TomlValue::String(transport.to_string()));
        server.insert("token".into(), TomlValue::String(token));
        let ports: Vec<TomlValue> = endpoint
          .ports
          .iter()
          .map(|p| TomlValue::String(format!("{}={}:{}", p.local, p.target_host.as_deref().unwrap_or("127.0.0.1"), p.remote)))
          .collect();
        server.insert("ports".into(), TomlValue::Array(ports));
        apply_passthrough_options(&mut server, &endpoint.extra);
        root.insert("server".into(), TomlValue::Table(server));

        let (_, control_port, control_ipv6) = parse_address_port(&bind_addr).unwrap_or(("0.0.0.0".to_string(), 0, false));

        let contents = toml::to_string_pretty(&TomlValue::Table(root))
          .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("failed to render backhaul toml: {e}")))?;

        Ok(RenderedEngine {
          argv: vec![
            resolve_binary("BACKHAUL_CLIENT_BINARY", "backhaul"),
            "-c".into(),
            config_path(Core::Backhaul, tunnel_id, "toml").to_string_lossy().into_owned(),
          ],
          env: vec![],
          config_file: Some((config_path(Core::Backhaul, tunnel_id, "toml"), contents)),
          counter_target: Some(CounterTarget::Local {
            port: control_port,
            is_ipv6: control_ipv6,
          }),
        })
      }
      EndpointMode::Client => {
        let remote_addr = endpoint
          .remote_addr
          .clone()
          .ok_or_else(|| OrchestratorError::Internal(anyhow::anyhow!("client endpoint missing remote_addr")))?;

        let mut client = Table::new();
        client.insert("remote_addr".into(), TomlValue::String(remote_addr.clone()));
        client.insert("transport".into(), TomlValue::String(transport.to_string()));
        client.insert("token".into(), TomlValue::String(token));
        apply_passthrough_options(&mut client, &endpoint.extra);
        root.insert("client".into(), TomlValue::Table(client));

        let contents = toml::to_string_pretty(&TomlValue::Table(root))
          .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("failed to render backhaul toml: {e}")))?;

        let counter_target = parse_address_port(&remote_addr).map(|(host, port, is_ipv6)| CounterTarget::Remote {
          host,
          port,
          is_ipv6,
        });

        Ok(RenderedEngine {
          argv: vec![
            resolve_binary("BACKHAUL_CLIENT_BINARY", "backhaul"),
            "-c".into(),
            config_path(Core::Backhaul, tunnel_id, "toml").to_string_lossy().into_owned(),
          ],
          env: vec![],
          config_file: Some((config_path(Core::Backhaul, tunnel_id, "toml"), contents)),
          counter_target,
        })
      }
    }
  }
}
