use crate::{
    error::GuardError,
    mcp::{SessionClient, SessionService},
    probe::{PhaseContext, Probe, ProbeResult},
};
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const HEALTH_POLL: Duration = Duration::from_millis(500);

/// Asks a running notebook server which errors it has seen for this notebook.
pub struct SessionQueryProbe {
    client: Arc<dyn SessionClient>,
    /// How long to wait for the endpoint to come up before calling it unreachable.
    wait: Duration,
}

impl SessionQueryProbe {
    pub fn new(client: Arc<dyn SessionClient>, wait: Duration) -> Self {
        Self { client, wait }
    }

    fn reachable(&self, ctx: &PhaseContext) -> Result<bool> {
        let deadline = Instant::now() + self.wait.min(ctx.remaining());
        loop {
            if self.client.health_check() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            if !ctx.cancel.sleep(HEALTH_POLL) {
                return Err(GuardError::Cancelled.into());
            }
        }
    }

    pub fn query(&self, ctx: &PhaseContext) -> Result<ProbeResult> {
        if !self.reachable(ctx)? {
            warn!("session-query endpoint unreachable");
            return Ok(ProbeResult::new(ctx.config.finding())
                .with_message("session-query endpoint unreachable")
                .with_metric("reachable", 0.0));
        }

        let summary = match self.client.errors_summary() {
            Ok(summary) => summary,
            Err(e) => {
                warn!("session-query errors summary failed: {e:#}");
                return Ok(ProbeResult::new(ctx.config.finding())
                    .with_message(format!("session-query errors summary unavailable: {e:#}"))
                    .with_metric("reachable", 1.0)
                    .with_details(json!({"error": format!("{e:#}")})));
            }
        };
        let errors = summary.errors_for(&ctx.notebook);
        let service = SessionService::new(self.client.as_ref());
        let active_session = service.warn_if_active(&ctx.notebook);
        let active_notebooks = service.active_sessions().len();
        info!(
            errors = errors.len(),
            total = summary.total_errors,
            "session-query answered"
        );

        let mut result = ProbeResult::pass();
        if !errors.is_empty() {
            result.status = ctx.config.finding();
            result.messages = errors.clone();
        }
        Ok(result
            .with_metric("reachable", 1.0)
            .with_metric("errors", errors.len() as f64)
            .with_details(json!({
                "total_errors": summary.total_errors,
                "active_notebooks": active_notebooks,
                "active_session": active_session,
            })))
    }
}

impl Probe for SessionQueryProbe {
    fn run(&self, ctx: &PhaseContext) -> Result<ProbeResult> {
        self.query(ctx)
    }
}
