//! Auto-reapply background task: periodically re-materializes every
//! persisted tunnel according to `Settings.tunnel`'s enable flag and
//! interval, the same convergence pass the restoration loop runs once at
//! boot, run here on a timer instead.

use std::sync::Arc;
use std::time::Duration;

use tunnelmux_core::orchestrator::PanelOrchestrator;

/// Re-checked every tick rather than read once, so an admin flipping
/// `auto_reapply_enabled` or the interval via `PUT /panel/settings` takes
/// effect without a restart.
pub fn spawn(orchestrator: Arc<PanelOrchestrator>, fallback_poll: Duration) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      let settings = orchestrator.get_settings().await;
      let next_check = if settings.tunnel.auto_reapply_enabled {
        run_once(&orchestrator).await;
        settings.tunnel.interval_as_duration()
      } else {
        fallback_poll
      };
      tokio::time::sleep(next_check).await;
    }
  })
}

async fn run_once(orchestrator: &PanelOrchestrator) {
  let results = orchestrator.reapply_all().await;
  let failed = results.iter().filter(|(_, r)| r.is_err()).count();
  tracing::info!(total = results.len(), failed, "auto-reapply pass complete");
}
