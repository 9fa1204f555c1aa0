//! Process supervisor: spawns, health-checks and reaps per-tunnel engine
//! subprocesses behind a trait-object seam (`Supervisor`) plus a single
//! concrete, mutex-guarded implementation.
//!
//! Deliberately does not auto-restart a failed child: restart is driven by
//! the orchestrator's reconciliation (explicit reapply, or the restoration
//! loop at boot).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::fs::File;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
  Starting,
  Running,
  Failed,
  Stopped,
}

#[derive(Debug, Clone)]
pub struct ProbeStatus {
  pub state: ProcessState,
  pub process_running: bool,
}

struct Supervised {
  child: Option<Child>,
  state: ProcessState,
  log_path: PathBuf,
  /// argv[0], kept for the defensive name-based pkill on removal.
  binary: String,
}

pub trait Supervisor: Send + Sync {
  fn spawn(
    &self,
    id: &str,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    log_path: PathBuf,
  ) -> BoxFuture<'_, Result<()>>;

  fn stop(&self, id: &str, grace: Duration) -> BoxFuture<'_, Result<()>>;

  fn is_running(&self, id: &str) -> BoxFuture<'_, bool>;

  fn probe(&self, id: &str) -> BoxFuture<'_, ProbeStatus>;

  fn pid(&self, id: &str) -> BoxFuture<'_, Option<u32>>;
}

/// How long to wait after spawning before checking the child survived,
/// tunable per core (rathole/gost start fast; backhaul can take longer).
#[derive(Debug, Clone, Copy)]
pub struct ProbeWindow(pub Duration);

impl Default for ProbeWindow {
  fn default() -> Self {
    Self(Duration::from_millis(700))
  }
}

pub struct ChildSupervisor {
  children: Arc<Mutex<HashMap<String, Supervised>>>,
  probe_window: ProbeWindow,
}

impl ChildSupervisor {
  pub fn new(probe_window: ProbeWindow) -> Self {
    Self {
      children: Arc::new(Mutex::new(HashMap::new())),
      probe_window,
    }
  }

  async fn read_log_tail(log_path: &PathBuf) -> String {
    const TAIL_CAP: usize = 1024;
    match tokio::fs::read(log_path).await {
      Ok(bytes) => {
        let start = bytes.len().saturating_sub(TAIL_CAP);
        String::from_utf8_lossy(&bytes[start..]).into_owned()
      }
      Err(_) => String::new(),
    }
  }

  async fn defensive_pkill(binary: &str, id: &str) {
    let pattern = format!("{binary}.*{id}");
    let _ = Command::new("pkill")
      .arg("-f")
      .arg(&pattern)
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .await;
  }
}

impl Default for ChildSupervisor {
  fn default() -> Self {
    Self::new(ProbeWindow::default())
  }
}

impl Supervisor for ChildSupervisor {
  fn spawn(
    &self,
    id: &str,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    log_path: PathBuf,
  ) -> BoxFuture<'_, Result<()>> {
    let id = id.to_string();
    let children = Arc::clone(&self.children);
    let probe_window = self.probe_window.0;

    async move {
      let Some((binary, args)) = argv.split_first() else {
        return Err(OrchestratorError::Validation("empty argv for spawn".into()));
      };
      let binary = binary.clone();

      let log_file = File::create(&log_path)
        .await
        .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("failed to open log {log_path:?}: {e}")))?
        .into_std()
        .await;
      let log_file_err = log_file
        .try_clone()
        .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("failed to dup log handle: {e}")))?;

      let mut command = Command::new(&binary);
      command
        .args(args)
        .envs(env)
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err));

      let child = command
        .spawn()
        .map_err(|e| OrchestratorError::engine_failure(format!("failed to spawn {binary}: {e}"), ""))?;

      {
        let mut guard = children.lock().await;
        guard.insert(
          id.clone(),
          Supervised {
            child: Some(child),
            state: ProcessState::Starting,
            log_path: log_path.clone(),
            binary: binary.clone(),
          },
        );
      }

      tokio::time::sleep(probe_window).await;

      let mut guard = children.lock().await;
      let entry = guard
        .get_mut(&id)
        .expect("entry inserted just above under the same lock discipline");

      let still_running = match entry.child.as_mut() {
        Some(child) => matches!(child.try_wait(), Ok(None)),
        None => false,
      };

      if still_running {
        entry.state = ProcessState::Running;
        tracing::info!(tunnel_id = %id, %binary, "engine process healthy after probe window");
        Ok(())
      } else {
        entry.state = ProcessState::Failed;
        let tail = Self::read_log_tail(&log_path).await;
        tracing::warn!(tunnel_id = %id, %binary, "engine process exited within probe window");
        Err(OrchestratorError::engine_failure(
          format!("{binary} failed to start"),
          tail,
        ))
      }
    }
    .boxed()
  }

  fn stop(&self, id: &str, grace: Duration) -> BoxFuture<'_, Result<()>> {
    let id = id.to_string();
    let children = Arc::clone(&self.children);

    async move {
      let removed = {
        let mut guard = children.lock().await;
        guard.remove(&id)
      };

      let Some(mut supervised) = removed else {
        return Ok(());
      };

      if let Some(mut child) = supervised.child.take() {
        if let Some(pid) = child.id() {
          send_sigterm(pid);
        }
        let waited = tokio::time::timeout(grace, child.wait()).await;
        if waited.is_err() {
          tracing::warn!(tunnel_id = %id, "engine did not exit before grace deadline, sending SIGKILL");
          let _ = child.kill().await;
          let _ = child.wait().await;
        }
      }

      Self::defensive_pkill(&supervised.binary, &id).await;
      Ok(())
    }
    .boxed()
  }

  fn is_running(&self, id: &str) -> BoxFuture<'_, bool> {
    let id = id.to_string();
    let children = Arc::clone(&self.children);
    async move {
      let mut guard = children.lock().await;
      match guard.get_mut(&id) {
        Some(entry) => match entry.child.as_mut() {
          Some(child) => matches!(child.try_wait(), Ok(None)),
          None => false,
        },
        None => false,
      }
    }
    .boxed()
  }

  fn probe(&self, id: &str) -> BoxFuture<'_, ProbeStatus> {
    let id = id.to_string();
    let children = Arc::clone(&self.children);
    async move {
      let mut guard = children.lock().await;
      match guard.get_mut(&id) {
        Some(entry) => {
          let process_running = match entry.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
          };
          if !process_running && entry.state == ProcessState::Running {
            entry.state = ProcessState::Failed;
          }
          ProbeStatus {
            state: entry.state,
            process_running,
          }
        }
        None => ProbeStatus {
          state: ProcessState::Stopped,
          process_running: false,
        },
      }
    }
    .boxed()
  }

  fn pid(&self, id: &str) -> BoxFuture<'_, Option<u32>> {
    let id = id.to_string();
    let children = Arc::clone(&self.children);
    async move {
      let guard = children.lock().await;
      guard.get(&id).and_then(|entry| entry.child.as_ref()).and_then(|c| c.id())
    }
    .boxed()
  }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
  use nix::sys::signal::{kill, Signal};
  use nix::unistd::Pid;
  let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn spawn_reports_engine_failure_for_missing_binary() {
    let supervisor = ChildSupervisor::new(ProbeWindow(Duration::from_millis(50)));
    let log_path = std::env::temp_dir().join(format!("tunnelmux-test-{}.log", crate::model::new_id()));
    let result = supervisor
      .spawn(
        "t1",
        vec!["/no/such/binary-tunnelmux-test".to_string()],
        vec![],
        log_path,
      )
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn spawn_stop_roundtrip_with_sleep() {
    let supervisor = ChildSupervisor::new(ProbeWindow(Duration::from_millis(100)));
    let log_path = std::env::temp_dir().join(format!("tunnelmux-test-{}.log", crate::model::new_id()));
    supervisor
      .spawn("t2", vec!["sleep".to_string(), "5".to_string()], vec![], log_path)
      .await
      .unwrap();
    assert!(supervisor.is_running("t2").await);
    supervisor.stop("t2", Duration::from_secs(2)).await.unwrap();
    assert!(!supervisor.is_running("t2").await);
  }
}
