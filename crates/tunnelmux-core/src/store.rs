//! The persisted-state boundary. A real database driver is out of scope;
//! [`Store`] is the trait-object seam the orchestrator talks to.
//! [`InMemoryStore`] is the only implementation built here: a mutex-guarded
//! map with no I/O.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;

use crate::model::{Node, NodeId, Settings, Tunnel, TunnelId, UsageRecord};

pub trait Store: Send + Sync {
  fn get_node(&self, id: &str) -> BoxFuture<'_, Option<Node>>;
  fn list_nodes(&self) -> BoxFuture<'_, Vec<Node>>;
  fn put_node(&self, node: Node) -> BoxFuture<'_, ()>;
  fn delete_node(&self, id: &str) -> BoxFuture<'_, Option<Node>>;

  fn get_tunnel(&self, id: &str) -> BoxFuture<'_, Option<Tunnel>>;
  fn list_tunnels(&self) -> BoxFuture<'_, Vec<Tunnel>>;
  fn put_tunnel(&self, tunnel: Tunnel) -> BoxFuture<'_, ()>;
  fn delete_tunnel(&self, id: &str) -> BoxFuture<'_, Option<Tunnel>>;
  /// Tunnels that reference `node_id` as either `iran_node_id`, `foreign_node_id`
  /// or the legacy `node_id`. Used to block a node delete while referenced.
  fn tunnels_for_node(&self, node_id: &str) -> BoxFuture<'_, Vec<Tunnel>>;

  fn append_usage(&self, record: UsageRecord) -> BoxFuture<'_, ()>;

  fn get_settings(&self) -> BoxFuture<'_, Settings>;
  fn put_settings(&self, settings: Settings) -> BoxFuture<'_, ()>;
}

impl<T: Store + ?Sized> Store for Arc<T> {
  fn get_node(&self, id: &str) -> BoxFuture<'_, Option<Node>> {
    self.as_ref().get_node(id)
  }
  fn list_nodes(&self) -> BoxFuture<'_, Vec<Node>> {
    self.as_ref().list_nodes()
  }
  fn put_node(&self, node: Node) -> BoxFuture<'_, ()> {
    self.as_ref().put_node(node)
  }
  fn delete_node(&self, id: &str) -> BoxFuture<'_, Option<Node>> {
    self.as_ref().delete_node(id)
  }
  fn get_tunnel(&self, id: &str) -> BoxFuture<'_, Option<Tunnel>> {
    self.as_ref().get_tunnel(id)
  }
  fn list_tunnels(&self) -> BoxFuture<'_, Vec<Tunnel>> {
    self.as_ref().list_tunnels()
  }
  fn put_tunnel(&self, tunnel: Tunnel) -> BoxFuture<'_, ()> {
    self.as_ref().put_tunnel(tunnel)
  }
  fn delete_tunnel(&self, id: &str) -> BoxFuture<'_, Option<Tunnel>> {
    self.as_ref().delete_tunnel(id)
  }
  fn tunnels_for_node(&self, node_id: &str) -> BoxFuture<'_, Vec<Tunnel>> {
    self.as_ref().tunnels_for_node(node_id)
  }
  fn append_usage(&self, record: UsageRecord) -> BoxFuture<'_, ()> {
    self.as_ref().append_usage(record)
  }
  fn get_settings(&self) -> BoxFuture<'_, Settings> {
    self.as_ref().get_settings()
  }
  fn put_settings(&self, settings: Settings) -> BoxFuture<'_, ()> {
    self.as_ref().put_settings(settings)
  }
}

#[derive(Default)]
struct Inner {
  nodes: BTreeMap<NodeId, Node>,
  tunnels: BTreeMap<TunnelId, Tunnel>,
  usage: Vec<UsageRecord>,
  settings: Settings,
}

/// An in-memory `Store`. Good enough to back the orchestrator in tests and
/// in small single-process deployments; a durable backend would implement
/// the same trait against a real table store.
pub struct InMemoryStore {
  inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner::default())),
    }
  }
}

impl Default for InMemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl Store for InMemoryStore {
  fn get_node(&self, id: &str) -> BoxFuture<'_, Option<Node>> {
    let inner = Arc::clone(&self.inner);
    let id = id.to_string();
    async move { inner.lock().await.nodes.get(&id).cloned() }.boxed()
  }

  fn list_nodes(&self) -> BoxFuture<'_, Vec<Node>> {
    let inner = Arc::clone(&self.inner);
    async move { inner.lock().await.nodes.values().cloned().collect() }.boxed()
  }

  fn put_node(&self, node: Node) -> BoxFuture<'_, ()> {
    let inner = Arc::clone(&self.inner);
    async move {
      inner.lock().await.nodes.insert(node.id.clone(), node);
    }
    .boxed()
  }

  fn delete_node(&self, id: &str) -> BoxFuture<'_, Option<Node>> {
    let inner = Arc::clone(&self.inner);
    let id = id.to_string();
    async move { inner.lock().await.nodes.remove(&id) }.boxed()
  }

  fn get_tunnel(&self, id: &str) -> BoxFuture<'_, Option<Tunnel>> {
    let inner = Arc::clone(&self.inner);
    let id = id.to_string();
    async move { inner.lock().await.tunnels.get(&id).cloned() }.boxed()
  }

  fn list_tunnels(&self) -> BoxFuture<'_, Vec<Tunnel>> {
    let inner = Arc::clone(&self.inner);
    async move { inner.lock().await.tunnels.values().cloned().collect() }.boxed()
  }

  fn put_tunnel(&self, tunnel: Tunnel) -> BoxFuture<'_, ()> {
    let inner = Arc::clone(&self.inner);
    async move {
      inner.lock().await.tunnels.insert(tunnel.id.clone(), tunnel);
    }
    .boxed()
  }

  fn delete_tunnel(&self, id: &str) -> BoxFuture<'_, Option<Tunnel>> {
    let inner = Arc::clone(&self.inner);
    let id = id.to_string();
    async move { inner.lock().await.tunnels.remove(&id) }.boxed()
  }

  fn tunnels_for_node(&self, node_id: &str) -> BoxFuture<'_, Vec<Tunnel>> {
    let inner = Arc::clone(&self.inner);
    let node_id = node_id.to_string();
    async move {
      inner
        .lock()
        .await
        .tunnels
        .values()
        .filter(|t| {
          t.node_id.as_deref() == Some(node_id.as_str())
            || t.iran_node_id.as_deref() == Some(node_id.as_str())
            || t.foreign_node_id.as_deref() == Some(node_id.as_str())
        })
        .cloned()
        .collect()
    }
    .boxed()
  }

  fn append_usage(&self, record: UsageRecord) -> BoxFuture<'_, ()> {
    let inner = Arc::clone(&self.inner);
    async move {
      inner.lock().await.usage.push(record);
    }
    .boxed()
  }

  fn get_settings(&self) -> BoxFuture<'_, Settings> {
    let inner = Arc::clone(&self.inner);
    async move { inner.lock().await.settings.clone() }.boxed()
  }

  fn put_settings(&self, settings: Settings) -> BoxFuture<'_, ()> {
    let inner = Arc::clone(&self.inner);
    async move {
      inner.lock().await.settings = settings;
    }
    .boxed()
  }
}
