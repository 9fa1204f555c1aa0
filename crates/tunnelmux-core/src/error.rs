//! Error taxonomy shared by the panel orchestrator, the node agent and the
//! adapters. Kinds map directly to the failure model in the panel contract:
//! only `Validation` and `Conflict` are guaranteed not to have mutated state.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
  #[error("validation error: {0}")]
  Validation(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("node unreachable: {0}")]
  NodeUnreachable(String),

  #[error("engine failure: {message}")]
  EngineFailure { message: String, log_tail: String },

  #[error("quota exceeded")]
  QuotaExceeded,

  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Validation(_) => ErrorKind::Validation,
      Self::NotFound(_) => ErrorKind::NotFound,
      Self::Conflict(_) => ErrorKind::Conflict,
      Self::NodeUnreachable(_) => ErrorKind::NodeUnreachable,
      Self::EngineFailure { .. } => ErrorKind::EngineFailure,
      Self::QuotaExceeded => ErrorKind::QuotaExceeded,
      Self::Internal(_) => ErrorKind::EngineFailure,
    }
  }

  /// Whether this error is allowed to persist the tunnel row with
  /// `status=error` and let a later reapply attempt convergence, as opposed
  /// to surfacing immediately without touching state.
  pub fn persists_as_error_status(&self) -> bool {
    matches!(
      self.kind(),
      ErrorKind::NodeUnreachable | ErrorKind::EngineFailure | ErrorKind::QuotaExceeded
    )
  }

  pub fn engine_failure(message: impl Into<String>, log_tail: impl Into<String>) -> Self {
    const LOG_TAIL_CAP: usize = 1024;
    let mut log_tail = log_tail.into();
    if log_tail.len() > LOG_TAIL_CAP {
      let start = log_tail.len() - LOG_TAIL_CAP;
      log_tail = log_tail.split_off(start);
    }
    Self::EngineFailure {
      message: message.into(),
      log_tail,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  Validation,
  NotFound,
  Conflict,
  NodeUnreachable,
  EngineFailure,
  QuotaExceeded,
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
