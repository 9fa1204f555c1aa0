//! Endpoint derivation: given a persisted tunnel and its resolved nodes,
//! compute the control port, the normalized port list, and the mirrored
//! server/client endpoint specs that the core adapters render into config
//! files and argv.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{OrchestratorError, Result};
use crate::model::{Core, Node, Tunnel};
use crate::ports::{parse_ports, render_ports, PortMapping};

/// Where a given side of a tunnel's engine instance runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointTarget {
  Panel,
  Node(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
  Server,
  Client,
}

#[derive(Debug, Clone)]
pub struct EndpointSpec {
  pub target: EndpointTarget,
  pub mode: EndpointMode,
  /// The tunnel's own `type` (tcp/udp/ws/wsmux/tcpmux/grpc), carried through
  /// so adapters read it instead of inventing their own spec-bag key for it.
  pub kind: String,
  pub bind_addr: Option<String>,
  pub remote_addr: Option<String>,
  pub ports: Vec<PortMapping>,
  /// Transport passthrough keys (token, tls flags, mux options, ...)
  /// copied from the user spec verbatim for the adapter to consume.
  pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct DerivedSpecs {
  pub control_port: Option<u16>,
  pub server: Option<EndpointSpec>,
  pub client: Option<EndpointSpec>,
  /// The canonical port list, to be written back into `tunnel.spec.ports`
  /// so a stored tunnel always reflects its normalized form.
  pub normalized_ports: Vec<PortMapping>,
}

/// Context needed to resolve the advertised panel host. An outer HTTP layer
/// (out of scope here) would populate the request-derived fields; absent
/// that layer, only the node/env-derived fields are used.
#[derive(Debug, Clone, Default)]
pub struct PanelHostHint {
  pub user_panel_host: Option<String>,
  pub forwarded_host: Option<String>,
  pub request_hostname: Option<String>,
  pub env_panel_public_ip: Option<String>,
}

fn is_loopback_or_unspecified(host: &str) -> bool {
  matches!(host, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0" | "")
}

fn strip_scheme_and_port(addr: &str) -> String {
  let without_scheme = addr.split_once("://").map(|(_, rest)| rest).unwrap_or(addr);
  if without_scheme.starts_with('[') {
    // bracketed IPv6, keep the bracketed literal, drop a trailing :port
    if let Some(end) = without_scheme.find(']') {
      return without_scheme[..=end].to_string();
    }
  }
  without_scheme
    .rsplit_once(':')
    .map(|(host, _)| host.to_string())
    .unwrap_or_else(|| without_scheme.to_string())
}

/// Resolve the panel host advertised to a foreign node for cores that reach
/// back to the panel (`chisel`, `frp`), in the documented precedence order.
pub fn resolve_panel_host(node: Option<&Node>, hint: &PanelHostHint) -> Result<String> {
  let candidates = [
    hint.user_panel_host.clone(),
    node.and_then(|n| n.panel_address().map(str::to_string)),
    hint.request_hostname.clone(),
    hint.forwarded_host.clone(),
    hint.env_panel_public_ip.clone(),
  ];

  for candidate in candidates.into_iter().flatten() {
    let host = strip_scheme_and_port(&candidate);
    if !is_loopback_or_unspecified(&host) {
      return Ok(host);
    }
  }

  Err(OrchestratorError::Validation(
    "could not resolve a non-loopback panel host for this tunnel; set panel_host, node.metadata.panel_address, or PANEL_PUBLIC_IP/PANEL_IP".to_string(),
  ))
}

fn is_ipv6(host: &str) -> bool {
  host.contains(':') && !host.starts_with('[')
}

fn bracket_if_ipv6(host: &str) -> String {
  if is_ipv6(host) {
    format!("[{host}]")
  } else {
    host.to_string()
  }
}

/// FNV-1a, chosen for being a trivial, dependency-free, stable hash: the
/// control port must be reproducible across process restarts from the
/// tunnel id alone, ruling out Rust's randomized default hasher.
fn stable_hash(s: &str) -> u64 {
  const FNV_OFFSET: u64 = 0xcbf29ce484222325;
  const FNV_PRIME: u64 = 0x100000001b3;
  let mut hash = FNV_OFFSET;
  for byte in s.as_bytes() {
    hash ^= *byte as u64;
    hash = hash.wrapping_mul(FNV_PRIME);
  }
  hash
}

fn spec_u64(spec: &BTreeMap<String, Value>, key: &str) -> Option<u64> {
  spec.get(key).and_then(Value::as_u64)
}

/// Control port derivation. `chisel`'s base depends on the user's
/// `listen_port`, so it alone needs the spec; the others use a fixed base
/// plus the tunnel id's stable hash.
fn compute_control_port(
  core: Core,
  tunnel: &Tunnel,
  panel_api_port: u16,
) -> Result<Option<u16>> {
  if let Some(port) = spec_u64(&tunnel.spec, "control_port") {
    let port = u16::try_from(port)
      .map_err(|_| OrchestratorError::Validation("control_port out of range".into()))?;
    return validate_control_port(port, panel_api_port);
  }

  let band = (stable_hash(&tunnel.id) % 1000) as u16;
  let base = match core {
    Core::Rathole => 23333u32,
    Core::Backhaul => 3080,
    Core::Frp => spec_u64(&tunnel.spec, "bind_port").unwrap_or(7000) as u32,
    Core::Chisel => {
      let listen_port = spec_u64(&tunnel.spec, "listen_port")
        .or_else(|| {
          tunnel
            .spec
            .get("ports")
            .and_then(|v| parse_ports(v).ok())
            .and_then(|p| p.first().map(|m| m.local as u64))
        })
        .ok_or_else(|| {
          OrchestratorError::Validation("chisel requires 'listen_port' or 'ports' in spec".into())
        })?;
      listen_port as u32 + 10_000
    }
    Core::Gost => return Ok(None),
  };

  let port = u16::try_from(base + band as u32)
    .map_err(|_| OrchestratorError::Validation("derived control port out of range".into()))?;
  validate_control_port(port, panel_api_port)
}

fn validate_control_port(port: u16, panel_api_port: u16) -> Result<Option<u16>> {
  if port == panel_api_port {
    return Err(OrchestratorError::Validation(format!(
      "control port {port} collides with the panel API port"
    )));
  }
  Ok(Some(port))
}

fn is_websocket_transport(core: Core, tunnel_type: &str) -> bool {
  match core {
    Core::Rathole => tunnel_type == "ws",
    Core::Backhaul => matches!(tunnel_type, "ws" | "wsmux"),
    _ => false,
  }
}

fn wants_tls(spec: &BTreeMap<String, Value>) -> bool {
  for key in ["tls", "websocket_tls", "tls_cert"] {
    if let Some(v) = spec.get(key) {
      if v.as_bool() == Some(true) || (v.is_string() && !v.as_str().unwrap_or("").is_empty()) {
        return true;
      }
    }
  }
  false
}

fn transport_extra(spec: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
  spec
    .iter()
    .filter(|(k, _)| k.as_str() != "ports")
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect()
}

/// Compute the mirrored server/client specs for a tunnel bound to its
/// resolved nodes. `iran`/`foreign` are `None` for `gost` single-node
/// tunnels, where `node_id` alone identifies the forwarder's node (or the
/// panel itself when absent).
pub fn derive_tunnel_specs(
  tunnel: &Tunnel,
  iran: Option<&Node>,
  foreign: Option<&Node>,
  panel_api_port: u16,
  panel_host_hint: &PanelHostHint,
) -> Result<DerivedSpecs> {
  let ports = match tunnel.spec.get("ports") {
    Some(v) => parse_ports(v)?,
    None => Vec::new(),
  };

  let control_port = compute_control_port(tunnel.core, tunnel, panel_api_port)?;
  let extra = transport_extra(&tunnel.spec);

  match tunnel.core {
    Core::Rathole | Core::Backhaul => {
      let iran = iran.ok_or_else(|| {
        OrchestratorError::Validation(format!("{} requires an iran node", tunnel.core.as_str()))
      })?;
      let foreign = foreign.ok_or_else(|| {
        OrchestratorError::Validation(format!("{} requires a foreign node", tunnel.core.as_str()))
      })?;
      let control_port = control_port.expect("reverse cores always derive a control port");

      let server = EndpointSpec {
        target: EndpointTarget::Node(iran.id.clone()),
        mode: EndpointMode::Server,
        kind: tunnel.kind.clone(),
        bind_addr: Some(format!("0.0.0.0:{control_port}")),
        remote_addr: None,
        ports: ports.clone(),
        extra: extra.clone(),
      };

      let iran_ip = iran.ip_address().ok_or_else(|| {
        OrchestratorError::Validation(format!("iran node {} has no ip_address", iran.id))
      })?;
      let remote_addr = build_client_remote_addr(tunnel.core, &tunnel.kind, iran_ip, control_port, &extra);

      let client = EndpointSpec {
        target: EndpointTarget::Node(foreign.id.clone()),
        mode: EndpointMode::Client,
        kind: tunnel.kind.clone(),
        bind_addr: None,
        remote_addr: Some(remote_addr),
        ports: ports.clone(),
        extra,
      };

      Ok(DerivedSpecs {
        control_port: Some(control_port),
        server: Some(server),
        client: Some(client),
        normalized_ports: ports,
      })
    }
    Core::Chisel | Core::Frp => {
      let foreign = foreign.ok_or_else(|| {
        OrchestratorError::Validation(format!("{} requires a foreign node", tunnel.core.as_str()))
      })?;
      let control_port = control_port.expect("reverse cores always derive a control port");

      let server = EndpointSpec {
        target: EndpointTarget::Panel,
        mode: EndpointMode::Server,
        kind: tunnel.kind.clone(),
        bind_addr: Some(format!("0.0.0.0:{control_port}")),
        remote_addr: None,
        ports: ports.clone(),
        extra: extra.clone(),
      };

      let panel_host = resolve_panel_host(Some(foreign), panel_host_hint)?;
      let remote_addr = format!("{}:{}", bracket_if_ipv6(&panel_host), control_port);

      let client = EndpointSpec {
        target: EndpointTarget::Node(foreign.id.clone()),
        mode: EndpointMode::Client,
        kind: tunnel.kind.clone(),
        bind_addr: None,
        remote_addr: Some(remote_addr),
        ports: ports.clone(),
        extra,
      };

      Ok(DerivedSpecs {
        control_port: Some(control_port),
        server: Some(server),
        client: Some(client),
        normalized_ports: ports,
      })
    }
    Core::Gost => {
      // iran_node_id present -> forwarder runs on that node; absent -> panel.
      let target = match &tunnel.iran_node_id {
        Some(id) => EndpointTarget::Node(id.clone()),
        None => EndpointTarget::Panel,
      };
      let server = EndpointSpec {
        target,
        mode: EndpointMode::Server,
        kind: tunnel.kind.clone(),
        bind_addr: None,
        remote_addr: None,
        ports: ports.clone(),
        extra,
      };
      Ok(DerivedSpecs {
        control_port: None,
        server: Some(server),
        client: None,
        normalized_ports: ports,
      })
    }
  }
}

fn build_client_remote_addr(
  core: Core,
  tunnel_type: &str,
  iran_ip: &str,
  control_port: u16,
  extra: &BTreeMap<String, Value>,
) -> String {
  if is_websocket_transport(core, tunnel_type) {
    let scheme = if wants_tls(extra) { "wss" } else { "ws" };
    format!("{scheme}://{}:{control_port}", bracket_if_ipv6(iran_ip))
  } else {
    format!("{}:{control_port}", bracket_if_ipv6(iran_ip))
  }
}

/// Write the normalized port list back into the tunnel's spec.
pub fn normalize_spec_ports(tunnel: &mut Tunnel, ports: &[PortMapping]) {
  if ports.is_empty() && !tunnel.spec.contains_key("ports") {
    return;
  }
  tunnel
    .spec
    .insert("ports".to_string(), render_ports(tunnel.core, ports));
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{new_id, NodeStatus};
  use serde_json::json;
  use std::collections::BTreeMap;

  fn node(id: &str, role: &str, ip: &str) -> Node {
    let mut metadata = BTreeMap::new();
    metadata.insert("role".to_string(), json!(role));
    metadata.insert("ip_address".to_string(), json!(ip));
    Node {
      id: id.to_string(),
      name: id.to_string(),
      fingerprint: "fp".to_string(),
      status: NodeStatus::Active,
      metadata,
    }
  }

  fn tunnel(core: Core, kind: &str, spec: BTreeMap<String, Value>) -> Tunnel {
    let now = chrono::Utc::now();
    Tunnel {
      id: new_id(),
      name: "t".to_string(),
      core,
      kind: kind.to_string(),
      node_id: None,
      iran_node_id: Some("iran".to_string()),
      foreign_node_id: Some("foreign".to_string()),
      spec,
      status: crate::model::TunnelStatus::Pending,
      error_message: None,
      revision: 0,
      used_mb: 0.0,
      quota_mb: 0.0,
      created_at: now,
      updated_at: now,
    }
  }

  #[test]
  fn rathole_control_port_in_band() {
    let iran = node("iran", "iran", "203.0.113.10");
    let foreign = node("foreign", "foreign", "198.51.100.5");
    let mut spec = BTreeMap::new();
    spec.insert("token".to_string(), json!("T"));
    spec.insert("ports".to_string(), json!([8080, 8081]));
    let t = tunnel(Core::Rathole, "tcp", spec);

    let derived = derive_tunnel_specs(&t, Some(&iran), Some(&foreign), 8000, &PanelHostHint::default()).unwrap();
    let control_port = derived.control_port.unwrap();
    assert!((23333..24333).contains(&control_port));

    let server = derived.server.unwrap();
    assert_eq!(server.bind_addr.as_deref(), Some(format!("0.0.0.0:{control_port}").as_str()));
    let client = derived.client.unwrap();
    assert_eq!(client.remote_addr.as_deref(), Some(format!("203.0.113.10:{control_port}").as_str()));
  }

  #[test]
  fn control_port_colliding_with_panel_api_port_is_rejected() {
    let iran = node("iran", "iran", "203.0.113.10");
    let foreign = node("foreign", "foreign", "198.51.100.5");
    let mut spec = BTreeMap::new();
    spec.insert("token".to_string(), json!("T"));
    spec.insert("control_port".to_string(), json!(8000));
    let t = tunnel(Core::Rathole, "tcp", spec);

    let err = derive_tunnel_specs(&t, Some(&iran), Some(&foreign), 8000, &PanelHostHint::default())
      .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
  }

  #[test]
  fn backhaul_wsmux_client_remote_is_ws_scheme() {
    let iran = node("iran", "iran", "203.0.113.10");
    let foreign = node("foreign", "foreign", "198.51.100.5");
    let mut spec = BTreeMap::new();
    spec.insert("transport".to_string(), json!("wsmux"));
    spec.insert("token".to_string(), json!("X"));
    spec.insert("ports".to_string(), json!(["9000=127.0.0.1:9000", "9001"]));
    let t = tunnel(Core::Backhaul, "wsmux", spec);

    let derived = derive_tunnel_specs(&t, Some(&iran), Some(&foreign), 8000, &PanelHostHint::default()).unwrap();
    let client = derived.client.unwrap();
    assert!(client.remote_addr.unwrap().starts_with("ws://203.0.113.10:"));
    assert_eq!(derived.normalized_ports.len(), 2);
    assert_eq!(derived.normalized_ports[1].target_host.as_deref(), None);
  }

  #[test]
  fn frp_resolves_panel_host_from_node_metadata() {
    let mut foreign = node("foreign", "foreign", "198.51.100.5");
    foreign
      .metadata
      .insert("panel_address".to_string(), json!("panel.example.net:8000"));
    let mut spec = BTreeMap::new();
    spec.insert("bind_port".to_string(), json!(7000));
    spec.insert("token".to_string(), json!("Y"));
    spec.insert("ports".to_string(), json!([6000, 6001]));
    let t = tunnel(Core::Frp, "tcp", spec);

    let derived = derive_tunnel_specs(&t, None, Some(&foreign), 8000, &PanelHostHint::default()).unwrap();
    let client = derived.client.unwrap();
    assert!(client.remote_addr.unwrap().starts_with("panel.example.net:"));
    let server = derived.server.unwrap();
    assert_eq!(server.target, EndpointTarget::Panel);
  }

  #[test]
  fn frp_rejects_loopback_panel_host() {
    let foreign = node("foreign", "foreign", "198.51.100.5");
    let mut spec = BTreeMap::new();
    spec.insert("bind_port".to_string(), json!(7000));
    let t = tunnel(Core::Frp, "tcp", spec);

    let err = derive_tunnel_specs(&t, None, Some(&foreign), 8000, &PanelHostHint::default()).unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
  }

  #[test]
  fn gost_dispatches_to_iran_node_when_present() {
    let mut spec = BTreeMap::new();
    spec.insert("ports".to_string(), json!([6000]));
    let mut t = tunnel(Core::Gost, "tcp", spec);
    t.foreign_node_id = None;

    let derived = derive_tunnel_specs(&t, None, None, 8000, &PanelHostHint::default()).unwrap();
    assert_eq!(
      derived.server.unwrap().target,
      EndpointTarget::Node("iran".to_string())
    );
  }

  #[test]
  fn gost_dispatches_to_panel_when_no_iran_node() {
    let mut spec = BTreeMap::new();
    spec.insert("ports".to_string(), json!([6000]));
    let mut t = tunnel(Core::Gost, "tcp", spec);
    t.iran_node_id = None;
    t.foreign_node_id = None;

    let derived = derive_tunnel_specs(&t, None, None, 8000, &PanelHostHint::default()).unwrap();
    assert_eq!(derived.server.unwrap().target, EndpointTarget::Panel);
  }
}
