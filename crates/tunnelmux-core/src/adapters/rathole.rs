//! `rathole`: TOML config, `[client]`/`[server]` sections plus a
//! `[*.services.<name>]` block per exposed port. Reverse tunnel: the server
//! half runs on the iran node (public-facing), the client half on the
//! foreign node (forwards to the real service).

use std::collections::BTreeMap;

use serde_json::Value;
use toml::value::{Table, Value as TomlValue};

use super::{config_path, parse_address_port, resolve_binary, CoreAdapter, RenderedEngine};
use crate::accountant::CounterTarget;
use crate::derive::{EndpointMode, EndpointSpec};
use crate::error::{OrchestratorError, Result};
use crate::model::Core;

pub struct RatholeAdapter;

fn service_name(tunnel_id: &str, index: usize) -> String {
  format!("{tunnel_id}_{index}")
}

fn get_str(extra: &BTreeMap<String, Value>, key: &str) -> Option<String> {
  extra.get(key).and_then(Value::as_str).map(str::to_string)
}

impl CoreAdapter for RatholeAdapter {
  fn render(&self, tunnel_id: &str, endpoint: &EndpointSpec) -> Result<RenderedEngine> {
    let token = get_str(&endpoint.extra, "token")
      .ok_or_else(|| OrchestratorError::Validation("rathole requires 'token' in spec".into()))?;

    let mut root = Table::new();

    match endpoint.mode {
      EndpointMode::Server => {
        let bind_addr = endpoint
          .bind_addr
          .clone()
          .ok_or_else(|| OrchestratorError::Internal(anyhow::anyhow!("server endpoint missing bind_addr")))?;

        let mut server = Table::new();
        server.insert("bind_addr".into(), TomlValue::String(bind_addr.clone()));
        server.insert("default_token".into(), TomlValue::String(token));

        let mut services = Table::new();
        if endpoint.ports.is_empty() {
          return Err(OrchestratorError::Validation(
            "rathole requires at least one port".into(),
          ));
        }
        for (i, port) in endpoint.ports.iter().enumerate() {
          let mut svc = Table::new();
          svc.insert(
            "bind_addr".into(),
            TomlValue::String(format!("0.0.0.0:{}", port.local)),
          );
          services.insert(service_name(tunnel_id, i), TomlValue::Table(svc));
        }
        server.insert("services".into(), TomlValue::Table(services));
        root.insert("server".into(), TomlValue::Table(server));

        let (_, control_port, control_ipv6) = parse_address_port(&bind_addr).unwrap_or(("0.0.0.0".to_string(), 0, false));

        let contents = toml::to_string_pretty(&TomlValue::Table(root))
          .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("failed to render rathole toml: {e}")))?;

        Ok(RenderedEngine {
          argv: vec![
            resolve_binary("RATHOLE_BINARY", "rathole"),
            "-s".into(),
            config_path(Core::Rathole, tunnel_id, "toml").to_string_lossy().into_owned(),
          ],
          env: vec![],
          config_file: Some((config_path(Core::Rathole, tunnel_id, "toml"), contents)),
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
        client.insert("default_token".into(), TomlValue::String(token));

        let mut services = Table::new();
        for (i, port) in endpoint.ports.iter().enumerate() {
          let host = port.target_host.as_deref().unwrap_or("127.0.0.1");
          let mut svc = Table::new();
          svc.insert(
            "local_addr".into(),
            TomlValue::String(format!("{host}:{}", port.remote)),
          );
          services.insert(service_name(tunnel_id, i), TomlValue::Table(svc));
        }
        client.insert("services".into(), TomlValue::Table(services));
        root.insert("client".into(), TomlValue::Table(client));

        let contents = toml::to_string_pretty(&TomlValue::Table(root))
          .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("failed to render rathole toml: {e}")))?;

        let counter_target = parse_address_port(&remote_addr).map(|(host, port, is_ipv6)| CounterTarget::Remote {
          host,
          port,
          is_ipv6,
        });

        Ok(RenderedEngine {
          argv: vec![
            resolve_binary("RATHOLE_BINARY", "rathole"),
            "-c".into(),
            config_path(Core::Rathole, tunnel_id, "toml").to_string_lossy().into_owned(),
          ],
          env: vec![],
          config_file: Some((config_path(Core::Rathole, tunnel_id, "toml"), contents)),
          counter_target,
        })
      }
    }
  }
}
