//! Entities from the data model: [`Node`], [`Tunnel`], [`UsageRecord`] and
//! [`Settings`]. Mirrors the field set laid out for the persisted tables,
//! kept independent of any particular storage backend (see [`crate::store`]).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type NodeId = String;
pub type TunnelId = String;

pub fn new_id() -> String {
  Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
  Active,
  Inactive,
  Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
  Iran,
  Foreign,
}

impl NodeRole {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Iran => "iran",
      Self::Foreign => "foreign",
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
  pub id: NodeId,
  pub name: String,
  pub fingerprint: String,
  pub status: NodeStatus,
  pub metadata: BTreeMap<String, Value>,
}

impl Node {
  pub fn role(&self) -> Option<NodeRole> {
    match self.metadata.get("role").and_then(Value::as_str) {
      Some("iran") => Some(NodeRole::Iran),
      Some("foreign") => Some(NodeRole::Foreign),
      _ => None,
    }
  }

  pub fn ip_address(&self) -> Option<&str> {
    self.metadata.get("ip_address").and_then(Value::as_str)
  }

  pub fn api_port(&self) -> u16 {
    self
      .metadata
      .get("api_port")
      .and_then(Value::as_u64)
      .and_then(|p| u16::try_from(p).ok())
      .unwrap_or(8888)
  }

  pub fn api_address(&self) -> Option<String> {
    if let Some(explicit) = self.metadata.get("api_address").and_then(Value::as_str) {
      return Some(explicit.to_string());
    }
    self
      .ip_address()
      .map(|ip| format!("{}:{}", ip, self.api_port()))
  }

  pub fn panel_address(&self) -> Option<&str> {
    self.metadata.get("panel_address").and_then(Value::as_str)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
  Pending,
  Active,
  Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Core {
  Rathole,
  Backhaul,
  Chisel,
  Frp,
  Gost,
}

impl Core {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Rathole => "rathole",
      Self::Backhaul => "backhaul",
      Self::Chisel => "chisel",
      Self::Frp => "frp",
      Self::Gost => "gost",
    }
  }

  pub fn from_str(s: &str) -> Option<Self> {
    match s {
      "rathole" => Some(Self::Rathole),
      "backhaul" => Some(Self::Backhaul),
      "chisel" => Some(Self::Chisel),
      "frp" => Some(Self::Frp),
      "gost" => Some(Self::Gost),
      _ => None,
    }
  }

  /// Reverse cores bind two distinct nodes by role; `gost` does not.
  pub fn is_reverse(&self) -> bool {
    !matches!(self, Self::Gost)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunnel {
  pub id: TunnelId,
  pub name: String,
  pub core: Core,
  #[serde(rename = "type")]
  pub kind: String,
  pub node_id: Option<NodeId>,
  pub iran_node_id: Option<NodeId>,
  pub foreign_node_id: Option<NodeId>,
  pub spec: BTreeMap<String, Value>,
  pub status: TunnelStatus,
  pub error_message: Option<String>,
  pub revision: u64,
  pub used_mb: f64,
  pub quota_mb: f64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Tunnel {
  /// Record a successful apply: clears the error and bumps `updated_at`.
  pub fn mark_active(&mut self, now: DateTime<Utc>) {
    self.status = TunnelStatus::Active;
    self.error_message = None;
    self.updated_at = now;
  }

  pub fn mark_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
    self.status = TunnelStatus::Error;
    self.error_message = Some(message.into());
    self.updated_at = now;
  }

  /// Apply a usage reading: monotonic, only ever moves forward.
  pub fn record_usage(&mut self, reported_mb: f64, now: DateTime<Utc>) {
    if reported_mb > self.used_mb {
      self.used_mb = reported_mb;
      self.updated_at = now;
    }
    if self.quota_mb > 0.0 && self.used_mb >= self.quota_mb {
      self.mark_error("quota exceeded", now);
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
  pub tunnel_id: TunnelId,
  pub node_id: Option<NodeId>,
  pub bytes: u64,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReapplySettings {
  pub auto_reapply_enabled: bool,
  pub auto_reapply_interval: u64,
  pub auto_reapply_interval_unit: ReapplyIntervalUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReapplyIntervalUnit {
  Minutes,
  Hours,
}

impl Default for ReapplyIntervalUnit {
  fn default() -> Self {
    Self::Minutes
  }
}

impl ReapplySettings {
  pub fn interval_as_duration(&self) -> std::time::Duration {
    let seconds = match self.auto_reapply_interval_unit {
      ReapplyIntervalUnit::Minutes => self.auto_reapply_interval * 60,
      ReapplyIntervalUnit::Hours => self.auto_reapply_interval * 3600,
    };
    std::time::Duration::from_secs(seconds.max(1))
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
  pub frp: Option<Value>,
  pub telegram: Option<Value>,
  pub tunnel: ReapplySettings,
  pub admin: Option<AdminCredentials>,
}

/// Persisted admin identity for the CLI's `admin create|update` subcommands.
/// Authentication itself (login, sessions, RBAC) is out of scope here; this
/// just gives those subcommands somewhere to write an admin row without the
/// orchestrator itself enforcing login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminCredentials {
  pub username: String,
  pub password_hash: String,
}
