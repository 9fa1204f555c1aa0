//! End-to-end scenario coverage for the panel orchestrator: each test
//! exercises `PanelOrchestrator` against a real `InMemoryStore` and the
//! real per-core adapters/derivation logic, with the process supervisor,
//! accountant and node transport faked so no test spawns a real engine
//! binary or makes a real network call.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{bare_tunnel, new_orchestrator, node, FakeAccountant, FakeNodeRpcClient, FakeSupervisor};
use tunnelmux_core::error::OrchestratorError;
use tunnelmux_core::model::{Core, TunnelStatus};
use tunnelmux_core::store::{InMemoryStore, Store};

const PANEL_API_PORT: u16 = 8000;

#[tokio::test]
async fn rathole_tcp_two_nodes() {
  let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
  let rpc = Arc::new(FakeNodeRpcClient::new());
  let supervisor = Arc::new(FakeSupervisor::new());
  let accountant = Arc::new(FakeAccountant::new());
  let orchestrator = new_orchestrator(store.clone(), rpc.clone(), supervisor, accountant, PANEL_API_PORT);

  store.put_node(node("iran-1", "iran", "203.0.113.10")).await;
  store.put_node(node("foreign-1", "foreign", "198.51.100.5")).await;

  let mut tunnel = bare_tunnel(Core::Rathole, "tcp");
  tunnel.iran_node_id = Some("iran-1".to_string());
  tunnel.foreign_node_id = Some("foreign-1".to_string());
  tunnel.spec.insert("token".to_string(), json!("shared-secret"));
  tunnel.spec.insert("ports".to_string(), json!([8080, 8081]));
  let tunnel_id = tunnel.id.clone();
  let tunnel = orchestrator.create_tunnel(tunnel).await.unwrap();
  assert_eq!(tunnel.id, tunnel_id);

  orchestrator.apply_tunnel(&tunnel_id).await.unwrap();

  let server_apply = rpc.applied_to("iran-1").await.expect("server side applied to iran node");
  assert_eq!(server_apply.request.core, Core::Rathole);
  let config = server_apply.request.config_file.expect("rathole server ships a config file");
  assert!(config.path.contains("rathole"));
  assert!(config.contents.contains("[server]"));

  let client_apply = rpc.applied_to("foreign-1").await.expect("client side applied to foreign node");
  let client_config = client_apply.request.config_file.expect("rathole client ships a config file");
  assert!(client_config.contents.contains("[client]"));
  // control port must fall in the documented rathole band
  let control_port_line = config
    .contents
    .lines()
    .find(|l| l.trim_start().starts_with("bind_addr"))
    .expect("server config has a bind_addr");
  let port: u16 = control_port_line
    .rsplit(':')
    .next()
    .unwrap()
    .trim_matches(|c: char| c == '"' || c == ' ')
    .parse()
    .unwrap();
  assert!((23333..24333).contains(&port), "control port {port} out of rathole band");

  let stored = store.get_tunnel(&tunnel_id).await.unwrap();
  assert_eq!(stored.status, TunnelStatus::Active);
}

#[tokio::test]
async fn backhaul_wsmux_client_dials_websocket_scheme() {
  let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
  let rpc = Arc::new(FakeNodeRpcClient::new());
  let supervisor = Arc::new(FakeSupervisor::new());
  let accountant = Arc::new(FakeAccountant::new());
  let orchestrator = new_orchestrator(store.clone(), rpc.clone(), supervisor, accountant, PANEL_API_PORT);

  store.put_node(node("iran-2", "iran", "203.0.113.20")).await;
  store.put_node(node("foreign-2", "foreign", "198.51.100.6")).await;

  let mut tunnel = bare_tunnel(Core::Backhaul, "wsmux");
  tunnel.iran_node_id = Some("iran-2".to_string());
  tunnel.foreign_node_id = Some("foreign-2".to_string());
  tunnel.spec.insert("transport".to_string(), json!("wsmux"));
  tunnel.spec.insert("token".to_string(), json!("wsmux-secret"));
  tunnel.spec.insert("ports".to_string(), json!(["9000=127.0.0.1:9000"]));
  let tunnel = orchestrator.create_tunnel(tunnel).await.unwrap();

  orchestrator.apply_tunnel(&tunnel.id).await.unwrap();

  let client_apply = rpc.applied_to("foreign-2").await.unwrap();
  let client_config = client_apply.request.config_file.unwrap();
  let remote_line = client_config.contents.lines().find(|l| l.contains("remote_addr")).unwrap();
  assert!(remote_line.contains("ws://203.0.113.20:"), "expected ws:// scheme, got: {remote_line}");

  let status = orchestrator.get_status(&tunnel.id).await.unwrap();
  assert_eq!(status.tunnel.status, TunnelStatus::Active);
  assert_eq!(status.server_running, Some(true));
  assert_eq!(status.client_running, Some(true));
}

#[tokio::test]
async fn chisel_reverse_server_runs_on_panel_client_on_foreign_node() {
  let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
  let rpc = Arc::new(FakeNodeRpcClient::new());
  let supervisor = Arc::new(FakeSupervisor::new());
  let accountant = Arc::new(FakeAccountant::new());
  let orchestrator = new_orchestrator(store.clone(), rpc.clone(), supervisor.clone(), accountant, PANEL_API_PORT);

  store.put_node(node("foreign-3", "foreign", "198.51.100.7")).await;

  let mut tunnel = bare_tunnel(Core::Chisel, "tcp");
  tunnel.foreign_node_id = Some("foreign-3".to_string());
  tunnel.spec.insert("listen_port".to_string(), json!(9001));
  tunnel.spec.insert("ports".to_string(), json!([9001]));
  let tunnel = orchestrator.create_tunnel(tunnel).await.unwrap();

  orchestrator.apply_tunnel(&tunnel.id).await.unwrap();

  let server_spawn = supervisor.spawned(&tunnel.id).await.expect("chisel server spawned panel-locally");
  assert!(server_spawn.argv.iter().any(|a| a == "server"));
  assert!(server_spawn.argv.iter().any(|a| a == "--reverse"));

  let client_apply = rpc.applied_to("foreign-3").await.expect("chisel client applied to foreign node");
  assert!(client_apply.request.argv.iter().any(|a| a == "client"));
  assert!(client_apply.request.argv.iter().any(|a| a.starts_with("R:0.0.0.0:9001:")));

  let stored = store.get_tunnel(&tunnel.id).await.unwrap();
  assert_eq!(stored.status, TunnelStatus::Active);
}

#[tokio::test]
async fn frp_tcp_mirrors_server_and_client_toml() {
  let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
  let rpc = Arc::new(FakeNodeRpcClient::new());
  let supervisor = Arc::new(FakeSupervisor::new());
  let accountant = Arc::new(FakeAccountant::new());
  let orchestrator = new_orchestrator(store.clone(), rpc.clone(), supervisor.clone(), accountant, PANEL_API_PORT);

  let mut foreign = node("foreign-4", "foreign", "198.51.100.8");
  foreign.metadata.insert("panel_address".to_string(), json!("panel.example.net"));
  store.put_node(foreign).await;

  let mut tunnel = bare_tunnel(Core::Frp, "tcp");
  tunnel.foreign_node_id = Some("foreign-4".to_string());
  tunnel.spec.insert("bind_port".to_string(), json!(7000));
  tunnel.spec.insert("token".to_string(), json!("frp-secret"));
  tunnel.spec.insert("ports".to_string(), json!([6000, 6001]));
  let tunnel = orchestrator.create_tunnel(tunnel).await.unwrap();

  orchestrator.apply_tunnel(&tunnel.id).await.unwrap();

  assert!(supervisor.spawned(&tunnel.id).await.is_some(), "frps spawned panel-locally");
  let client_apply = rpc.applied_to("foreign-4").await.expect("frpc applied to foreign node");
  let client_config = client_apply.request.config_file.unwrap();
  assert!(client_config.contents.contains("serverAddr = \"panel.example.net\""));
  assert!(client_config.contents.contains("remotePort = 6000"));
  assert!(client_config.contents.contains("remotePort = 6001"));

  let stored = store.get_tunnel(&tunnel.id).await.unwrap();
  assert_eq!(stored.status, TunnelStatus::Active);
}

#[tokio::test]
async fn quota_overrun_marks_error_and_blocks_reapply() {
  let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
  let rpc = Arc::new(FakeNodeRpcClient::new());
  let supervisor = Arc::new(FakeSupervisor::new());
  let accountant = Arc::new(FakeAccountant::new());
  let orchestrator = new_orchestrator(store.clone(), rpc, supervisor, accountant, PANEL_API_PORT);

  store.put_node(node("foreign-5", "foreign", "198.51.100.9")).await;

  let mut tunnel = bare_tunnel(Core::Gost, "tcp");
  tunnel.iran_node_id = Some("foreign-5".to_string()); // gost dispatches to whichever node is iran_node_id
  tunnel.foreign_node_id = None;
  tunnel.spec.insert("ports".to_string(), json!([5000]));
  tunnel.quota_mb = 100.0;
  // role check only applies to reverse cores; gost skips it, so a foreign
  // node can stand in as the forwarder's host here.
  let tunnel = orchestrator.create_tunnel(tunnel).await.unwrap();

  orchestrator.apply_tunnel(&tunnel.id).await.unwrap();
  let stored = store.get_tunnel(&tunnel.id).await.unwrap();
  assert_eq!(stored.status, TunnelStatus::Active);

  let err = orchestrator.push_usage(&tunnel.id, None, 150.0).await.unwrap_err();
  assert!(matches!(err, OrchestratorError::QuotaExceeded));

  let stored = store.get_tunnel(&tunnel.id).await.unwrap();
  assert_eq!(stored.status, TunnelStatus::Error);
  assert_eq!(stored.used_mb, 150.0);

  let err = orchestrator.apply_tunnel(&tunnel.id).await.unwrap_err();
  assert!(matches!(err, OrchestratorError::QuotaExceeded));
}

#[tokio::test]
async fn panel_restart_recovery_reapplies_all_persisted_tunnels() {
  let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

  store.put_node(node("iran-6", "iran", "203.0.113.30")).await;
  store.put_node(node("foreign-6", "foreign", "198.51.100.10")).await;

  {
    // "Before the restart": apply three tunnels through one orchestrator
    // instance, as if the panel had been running for a while.
    let rpc = Arc::new(FakeNodeRpcClient::new());
    let supervisor = Arc::new(FakeSupervisor::new());
    let accountant = Arc::new(FakeAccountant::new());
    let orchestrator = new_orchestrator(store.clone(), rpc, supervisor, accountant, PANEL_API_PORT);

    let mut rathole = bare_tunnel(Core::Rathole, "tcp");
    rathole.iran_node_id = Some("iran-6".to_string());
    rathole.foreign_node_id = Some("foreign-6".to_string());
    rathole.spec.insert("token".to_string(), json!("t1"));
    rathole.spec.insert("ports".to_string(), json!([8080]));
    let rathole = orchestrator.create_tunnel(rathole).await.unwrap();
    orchestrator.apply_tunnel(&rathole.id).await.unwrap();

    let mut backhaul = bare_tunnel(Core::Backhaul, "tcp");
    backhaul.iran_node_id = Some("iran-6".to_string());
    backhaul.foreign_node_id = Some("foreign-6".to_string());
    backhaul.spec.insert("token".to_string(), json!("t2"));
    backhaul.spec.insert("ports".to_string(), json!(["9000=127.0.0.1:9000"]));
    let backhaul = orchestrator.create_tunnel(backhaul).await.unwrap();
    orchestrator.apply_tunnel(&backhaul.id).await.unwrap();

    let mut chisel = bare_tunnel(Core::Chisel, "tcp");
    chisel.foreign_node_id = Some("foreign-6".to_string());
    chisel.spec.insert("listen_port".to_string(), json!(9002));
    chisel.spec.insert("ports".to_string(), json!([9002]));
    let chisel = orchestrator.create_tunnel(chisel).await.unwrap();
    orchestrator.apply_tunnel(&chisel.id).await.unwrap();
  }

  // "After the restart": a fresh orchestrator over the same persisted
  // store, with brand new (empty) supervisor/accountant/rpc state, exactly
  // as a restarted panel process would start with nothing in memory.
  let rpc = Arc::new(FakeNodeRpcClient::new());
  let supervisor = Arc::new(FakeSupervisor::new());
  let accountant = Arc::new(FakeAccountant::new());
  let orchestrator = new_orchestrator(store.clone(), rpc.clone(), supervisor.clone(), accountant, PANEL_API_PORT);

  let report = tunnelmux_core::restore::restore_all(&orchestrator, &store).await;

  assert!(report.failed.is_empty(), "restoration failures: {:?}", report.failed);
  // chisel's server half is panel-hosted and restored first...
  assert_eq!(report.panel_local_applied, 1);
  // ...rathole and backhaul are node-hosted on both sides, restored second.
  assert_eq!(report.node_side_applied, 2);

  for tunnel in store.list_tunnels().await {
    assert_eq!(tunnel.status, TunnelStatus::Active, "{} did not recover", tunnel.id);
  }

  assert!(rpc.applied_to("iran-6").await.is_some());
  assert!(rpc.applied_to("foreign-6").await.is_some());

  let persisted = store.list_tunnels().await;
  let chisel_id = persisted.iter().find(|t| t.core == Core::Chisel).unwrap().id.clone();
  assert!(supervisor.spawned(&chisel_id).await.is_some());
}
