//! Port list normalization. The raw `spec.ports` value accepted from a
//! create/update request can take any of several shapes (int, string,
//! comma-list, object, array of mixed forms); this module parses all of
//! them into one canonical [`PortMapping`] list, then renders that list
//! back into the per-core shape each adapter expects.

use serde_json::Value;

use crate::error::{OrchestratorError, Result};
use crate::model::Core;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
  pub local: u16,
  pub remote: u16,
  pub target_host: Option<String>,
}

impl PortMapping {
  pub fn single(port: u16) -> Self {
    Self {
      local: port,
      remote: port,
      target_host: None,
    }
  }
}

/// Parse the `ports` field of a spec into canonical [`PortMapping`]s,
/// accepting any of the shapes a tunnel's port list may arrive in.
pub fn parse_ports(value: &Value) -> Result<Vec<PortMapping>> {
  match value {
    Value::Null => Ok(Vec::new()),
    Value::Number(n) => {
      let port = n
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| OrchestratorError::Validation(format!("invalid port number: {n}")))?;
      Ok(vec![PortMapping::single(port)])
    }
    Value::String(s) => parse_port_string_list(s),
    Value::Array(items) => {
      let mut out = Vec::with_capacity(items.len());
      for item in items {
        out.extend(parse_port_entry(item)?);
      }
      Ok(out)
    }
    other => Err(OrchestratorError::Validation(format!(
      "unsupported ports value: {other}"
    ))),
  }
}

fn parse_port_string_list(s: &str) -> Result<Vec<PortMapping>> {
  let mut out = Vec::new();
  for part in s.split(',') {
    let part = part.trim();
    if part.is_empty() {
      continue;
    }
    out.push(parse_port_string_entry(part)?);
  }
  Ok(out)
}

/// A single port-string entry: a bare number, `"8080"`, or the core-specific
/// `"<listen_port>=<target_host>:<target_port>"` form used by `backhaul`.
fn parse_port_string_entry(part: &str) -> Result<PortMapping> {
  if let Some((listen, target)) = part.split_once('=') {
    let local: u16 = listen
      .trim()
      .parse()
      .map_err(|_| OrchestratorError::Validation(format!("invalid listen port: {listen}")))?;
    let (host, port) = target
      .trim()
      .rsplit_once(':')
      .ok_or_else(|| OrchestratorError::Validation(format!("invalid target '{target}', expected host:port")))?;
    let remote: u16 = port
      .parse()
      .map_err(|_| OrchestratorError::Validation(format!("invalid target port: {port}")))?;
    return Ok(PortMapping {
      local,
      remote,
      target_host: Some(host.to_string()),
    });
  }
  let port: u16 = part
    .parse()
    .map_err(|_| OrchestratorError::Validation(format!("invalid port: {part}")))?;
  Ok(PortMapping::single(port))
}

fn parse_port_entry(value: &Value) -> Result<Vec<PortMapping>> {
  match value {
    Value::Number(n) => {
      let port = n
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| OrchestratorError::Validation(format!("invalid port number: {n}")))?;
      Ok(vec![PortMapping::single(port)])
    }
    Value::String(s) => Ok(vec![parse_port_string_entry(s)?]),
    Value::Object(map) => {
      let local = map
        .get("local")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| OrchestratorError::Validation("port object missing 'local'".into()))?;
      let remote = map
        .get("remote")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(local);
      let target_host = map
        .get("target_host")
        .and_then(Value::as_str)
        .map(str::to_string);
      Ok(vec![PortMapping {
        local,
        remote,
        target_host,
      }])
    }
    other => Err(OrchestratorError::Validation(format!(
      "unsupported port entry: {other}"
    ))),
  }
}

/// Render the canonical mapping list back to the shape each core persists
/// and consumes; stable across repeated normalize-then-render round trips.
pub fn render_ports(core: Core, ports: &[PortMapping]) -> Value {
  match core {
    Core::Backhaul => Value::Array(
      ports
        .iter()
        .map(|p| {
          let host = p.target_host.as_deref().unwrap_or("127.0.0.1");
          Value::String(format!("{}={}:{}", p.local, host, p.remote))
        })
        .collect(),
    ),
    Core::Frp => Value::Array(
      ports
        .iter()
        .map(|p| {
          serde_json::json!({ "local": p.local, "remote": p.remote })
        })
        .collect(),
    ),
    Core::Rathole | Core::Chisel | Core::Gost => {
      Value::Array(ports.iter().map(|p| Value::from(p.local)).collect())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn parses_single_int() {
    let ports = parse_ports(&json!(8080)).unwrap();
    assert_eq!(ports, vec![PortMapping::single(8080)]);
  }

  #[test]
  fn parses_comma_string() {
    let ports = parse_ports(&json!("8080,8081")).unwrap();
    assert_eq!(ports, vec![PortMapping::single(8080), PortMapping::single(8081)]);
  }

  #[test]
  fn parses_mixed_array() {
    let ports = parse_ports(&json!([8080, "8081", {"local": 9000, "remote": 9001, "target_host": "10.0.0.1"}])).unwrap();
    assert_eq!(
      ports,
      vec![
        PortMapping::single(8080),
        PortMapping::single(8081),
        PortMapping {
          local: 9000,
          remote: 9001,
          target_host: Some("10.0.0.1".to_string())
        },
      ]
    );
  }

  #[test]
  fn parses_backhaul_inline_target() {
    let ports = parse_ports(&json!("9000=127.0.0.1:9000")).unwrap();
    assert_eq!(
      ports,
      vec![PortMapping {
        local: 9000,
        remote: 9000,
        target_host: Some("127.0.0.1".to_string())
      }]
    );
  }

  #[test]
  fn renders_backhaul_shape_round_trips() {
    let ports = parse_ports(&json!(["9000=127.0.0.1:9000", "9001"])).unwrap();
    let rendered = render_ports(Core::Backhaul, &ports);
    assert_eq!(
      rendered,
      json!(["9000=127.0.0.1:9000", "9001=127.0.0.1:9001"])
    );
  }

  #[test]
  fn renders_frp_shape() {
    let ports = parse_ports(&json!([6000, 6001])).unwrap();
    let rendered = render_ports(Core::Frp, &ports);
    assert_eq!(rendered, json!([{"local":6000,"remote":6000},{"local":6001,"remote":6001}]));
  }
}
