use crate::{
    error::GuardError,
    preview::{PreviewLauncher, PreviewMode, log_excerpt},
    probe::{PhaseContext, Probe, ProbeResult},
    util::pick_free_port,
};
use anyhow::{Context, Result};
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

pub const ERROR_PATTERNS: [&str; 9] = [
    "Traceback",
    "NameError",
    "KeyError",
    "AttributeError",
    "TypeError",
    "ValueError",
    "Exception",
    "Chart Error:",
    "SELFTEST: FAIL",
];

const LOG_EXCERPT_CHARS: usize = 1000;
/// Time reserved at the end of the phase for teardown.
const TEARDOWN_RESERVE: Duration = Duration::from_secs(3);

/// Distinct error patterns found in `logs`, in pattern order.
pub fn scan_logs(logs: &str) -> Result<Vec<String>> {
    let alternation = ERROR_PATTERNS
        .iter()
        .map(|p| regex::escape(p))
        .collect::<Vec<_>>()
        .join("|");
    let re = Regex::new(&alternation)?;
    let found: Vec<&str> = re.find_iter(logs).map(|m| m.as_str()).collect();
    Ok(ERROR_PATTERNS
        .iter()
        .filter(|p| found.contains(p))
        .map(|p| p.to_string())
        .collect())
}

/// Boots a headless instance for a short window and scans its logs.
pub struct SmokeProbe {
    launcher: Arc<dyn PreviewLauncher>,
    window: Duration,
    port: Option<u16>,
}

impl SmokeProbe {
    pub fn new(launcher: Arc<dyn PreviewLauncher>, window: Duration, port: Option<u16>) -> Self {
        Self {
            launcher,
            window,
            port,
        }
    }
}

impl Probe for SmokeProbe {
    fn run(&self, ctx: &PhaseContext) -> Result<ProbeResult> {
        let port = match self.port {
            Some(p) => p,
            None => pick_free_port(None)?,
        };
        let started = Instant::now();
        let mut handle = self
            .launcher
            .launch(&ctx.notebook, port, PreviewMode::Run)
            .with_context(|| "starting headless instance")?;

        let window = self
            .window
            .min(ctx.remaining().saturating_sub(TEARDOWN_RESERVE))
            .max(Duration::from_millis(100));
        let deadline = started + window;
        let mut early_exit = None;
        while Instant::now() < deadline {
            if let Some(status) = handle.exit_status() {
                early_exit = Some(status);
                break;
            }
            if !ctx.cancel.sleep(Duration::from_millis(100)) {
                handle.shutdown()?;
                return Err(GuardError::Cancelled.into());
            }
        }
        handle.shutdown()?;

        let elapsed = started.elapsed();
        let hits = scan_logs(&handle.logs())?;
        info!(port, elapsed_ms = elapsed.as_millis() as u64, hits = hits.len(), "smoke finished");

        let mut result = match &early_exit {
            Some(status) => ProbeResult::fail(format!("headless instance exited early: {status}")),
            None => ProbeResult::pass(),
        };
        if !hits.is_empty() {
            result.status = result.status.worst(ctx.config.finding());
            result = result.with_message(format!("error patterns in logs: {}", hits.join(", ")));
        }
        if let Some(path) = handle.log_path() {
            result = result.with_artifact("log", path);
        }
        Ok(result
            .with_metric("elapsed_sec", (elapsed.as_secs_f64() * 100.0).round() / 100.0)
            .with_metric("error_patterns", hits.len() as f64)
            .with_details(json!({
                "port": port,
                "log_error_patterns": hits,
                "log_excerpt": log_excerpt(handle.as_ref(), LOG_EXCERPT_CHARS),
            })))
    }
}
