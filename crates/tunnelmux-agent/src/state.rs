use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::Mutex;
use tunnelmux_core::accountant::Accountant;
use tunnelmux_core::error::{ErrorKind, OrchestratorError};
use tunnelmux_core::model::{Core, TunnelId};
use tunnelmux_core::supervisor::Supervisor;

/// What the agent remembers about a tunnel it has been told to apply, so
/// `/agent/status` and the usage-push loop don't need the panel to resend it.
#[derive(Clone)]
pub struct TunnelRuntime {
  pub core: Core,
}

pub struct AppState {
  pub node_id: String,
  pub supervisor: Arc<dyn Supervisor>,
  pub accountant: Arc<dyn Accountant>,
  pub tunnels: Mutex<HashMap<TunnelId, TunnelRuntime>>,
  pub stop_grace: Duration,
}

/// Wraps [`OrchestratorError`] so handlers can just `?` and get a sensible
/// HTTP status, mirroring how the panel maps the same error taxonomy.
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
  fn from(err: OrchestratorError) -> Self {
    Self(err)
  }
}

impl From<anyhow::Error> for ApiError {
  fn from(err: anyhow::Error) -> Self {
    Self(OrchestratorError::Internal(err))
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = match self.0.kind() {
      ErrorKind::Validation => StatusCode::BAD_REQUEST,
      ErrorKind::NotFound => StatusCode::NOT_FOUND,
      ErrorKind::Conflict => StatusCode::CONFLICT,
      ErrorKind::NodeUnreachable => StatusCode::BAD_GATEWAY,
      ErrorKind::EngineFailure => StatusCode::UNPROCESSABLE_ENTITY,
      ErrorKind::QuotaExceeded => StatusCode::FORBIDDEN,
    };
    let body = Json(serde_json::json!({ "error": self.0.to_string() }));
    (status, body).into_response()
  }
}
