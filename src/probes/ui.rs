//! Live UI verification against a foreground preview.
//!
//! The verifier walks `idle -> launching -> waiting_ready -> connected ->
//! checking -> done`, dropping to `error` when the preview exits or never
//! becomes ready. The preview is shut down on every path out of the walk.

use crate::{
    config::Ui,
    engine::{BrowseIn, BrowseOut, Budget, NotebookEngine},
    error::GuardError,
    preview::{PreviewHandle, PreviewLauncher, PreviewMode, Readiness, log_excerpt, wait_ready},
    probe::{PhaseContext, Probe, ProbeResult, Status},
    util::{ensure_dir, fmt_duration, notebook_key, pick_free_port},
};
use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const LOG_EXCERPT_CHARS: usize = 1000;
const TEARDOWN_RESERVE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UiState {
    Idle,
    Launching,
    WaitingReady,
    Connected,
    Checking,
    Done,
    Error,
}

/// Visited states, in order.
#[derive(Debug, Default)]
struct Trail(Vec<UiState>);

impl Trail {
    fn to(&mut self, next: UiState) {
        debug!(from = ?self.0.last(), to = ?next, "ui state");
        self.0.push(next);
    }
}

#[derive(Debug, Clone)]
pub struct UiOptions {
    pub port: Option<u16>,
    pub error_allowlist: Vec<String>,
    pub dom_samples: u32,
    pub sample_interval: Duration,
    pub selectors: BTreeMap<String, Vec<String>>,
    /// Relative paths resolve against the project root.
    pub logs_dir: PathBuf,
}

impl UiOptions {
    pub fn from_config(ui: &Ui, logs_dir: &Path) -> Self {
        Self {
            port: ui.port,
            error_allowlist: ui.error_allowlist.clone(),
            dom_samples: ui.dom_samples,
            sample_interval: Duration::from_millis(ui.sample_interval_ms),
            selectors: ui.selectors.by_library(),
            logs_dir: logs_dir.to_path_buf(),
        }
    }

    fn allowed(&self, console_error: &str) -> bool {
        self.error_allowlist
            .iter()
            .any(|needle| !needle.is_empty() && console_error.contains(needle.as_str()))
    }
}

pub struct UiVerifier {
    engine: Arc<dyn NotebookEngine>,
    launcher: Arc<dyn PreviewLauncher>,
    opts: UiOptions,
}

impl UiVerifier {
    pub fn new(
        engine: Arc<dyn NotebookEngine>,
        launcher: Arc<dyn PreviewLauncher>,
        opts: UiOptions,
    ) -> Self {
        Self {
            engine,
            launcher,
            opts,
        }
    }

    fn drive(
        &self,
        ctx: &PhaseContext,
        handle: &mut dyn PreviewHandle,
        trail: &mut Trail,
    ) -> Result<ProbeResult> {
        if let Some(status) = handle.exit_status() {
            trail.to(UiState::Error);
            return Ok(ProbeResult::fail(format!(
                "preview exited before becoming ready: {status}"
            )));
        }

        trail.to(UiState::WaitingReady);
        let ready_window = ctx.remaining() / 2;
        match wait_ready(handle, ready_window, &ctx.cancel) {
            Readiness::Ready => {}
            Readiness::Exited(status) => {
                trail.to(UiState::Error);
                return Ok(ProbeResult::fail(format!(
                    "preview exited before becoming ready: {status}"
                )));
            }
            Readiness::TimedOut => {
                trail.to(UiState::Error);
                return Ok(ProbeResult::fail(format!(
                    "preview did not become ready within {} (readiness budget, half of the {} phase timeout)",
                    fmt_duration(ready_window),
                    fmt_duration(ctx.config.timeout)
                )));
            }
            Readiness::Cancelled => return Err(GuardError::Cancelled.into()),
        }

        trail.to(UiState::Connected);
        let logs_dir = ctx.project_root.join(&self.opts.logs_dir);
        ensure_dir(&logs_dir)?;
        let key = notebook_key(&ctx.notebook);
        let browse_window = ctx.remaining().saturating_sub(TEARDOWN_RESERVE);
        let req = BrowseIn {
            url: format!("http://127.0.0.1:{}/", handle.port()),
            timeout_ms: u64::try_from(browse_window.as_millis()).unwrap_or(u64::MAX),
            dom_samples: self.opts.dom_samples,
            sample_interval_ms: u64::try_from(self.opts.sample_interval.as_millis())
                .unwrap_or(u64::MAX),
            selectors: self.opts.selectors.clone(),
            screenshot_path: logs_dir
                .join(format!("guard_ui_{key}.png"))
                .display()
                .to_string(),
            html_path: logs_dir
                .join(format!("guard_ui_{key}.html"))
                .display()
                .to_string(),
        };
        let budget = Budget {
            timeout: ctx.remaining(),
            cancel: ctx.cancel.clone(),
        };
        let out = self.engine.browse(&req, &budget)?;

        trail.to(UiState::Checking);
        let result = self.assess(ctx, &req, out);
        trail.to(if result.status == Status::Fail {
            UiState::Error
        } else {
            UiState::Done
        });
        Ok(result)
    }

    fn assess(&self, ctx: &PhaseContext, req: &BrowseIn, out: BrowseOut) -> ProbeResult {
        if out.unavailable {
            return ProbeResult::new(Status::Warn).with_message(format!(
                "browser automation unavailable: {}",
                out.error.as_deref().unwrap_or("not installed")
            ));
        }

        let finding = ctx.config.finding();
        let mut status = Status::Pass;
        let mut messages = Vec::new();

        if let Some(err) = &out.error {
            status = status.worst(finding);
            messages.push(format!("browser session failed: {err}"));
        }

        let (allowed, console_errors): (Vec<_>, Vec<_>) = out
            .console_errors
            .iter()
            .cloned()
            .partition(|e| self.opts.allowed(e));
        for e in &console_errors {
            status = status.worst(finding);
            messages.push(format!("console error: {e}"));
        }
        for r in &out.request_failures {
            status = status.worst(finding);
            messages.push(format!("request failed: {r}"));
        }

        let dom_matches: u32 = out.dom.values().flat_map(|m| m.values()).sum();
        if dom_matches == 0 && out.error.is_none() {
            status = status.worst(finding);
            messages.push("no chart DOM nodes matched any library selector".to_string());
        }

        let mut result = ProbeResult::new(status);
        result.messages = messages;
        if let Some(path) = out.screenshot.as_deref().filter(|p| !p.is_empty()) {
            result = result.with_artifact("screenshot", path);
        }
        if let Some(path) = out.html.as_deref().filter(|p| !p.is_empty()) {
            result = result.with_artifact("html", path);
        }
        result
            .with_metric("console_errors", console_errors.len() as f64)
            .with_metric("request_failures", out.request_failures.len() as f64)
            .with_metric("dom_matches", f64::from(dom_matches))
            .with_details(json!({
                "url": req.url,
                "console_errors": console_errors,
                "console_errors_allowlisted": allowed,
                "console_warnings": out.console_warnings,
                "request_failures": out.request_failures,
                "dom": out.dom,
            }))
    }
}

impl Probe for UiVerifier {
    fn run(&self, ctx: &PhaseContext) -> Result<ProbeResult> {
        let mut trail = Trail::default();
        trail.to(UiState::Idle);

        let port = match self.opts.port {
            Some(p) => p,
            None => pick_free_port(None)?,
        };
        trail.to(UiState::Launching);
        let mut handle = match self.launcher.launch(&ctx.notebook, port, PreviewMode::Run) {
            Ok(h) => h,
            Err(e) => {
                trail.to(UiState::Error);
                return Ok(ProbeResult::fail(format!("preview launch failed: {e:#}"))
                    .with_details(json!({"port": port, "states": trail.0})));
            }
        };
        info!(port, "ui verification started");

        let outcome = self.drive(ctx, handle.as_mut(), &mut trail);
        let excerpt = log_excerpt(handle.as_ref(), LOG_EXCERPT_CHARS);
        if let Err(e) = handle.shutdown() {
            warn!(port, "preview teardown failed: {e:#}");
        }
        let mut result = outcome?;

        if trail.0.last() == Some(&UiState::Error) {
            if let Some(path) = handle.log_path() {
                result = result.with_artifact("preview_log", path);
            }
        }
        let mut details = match result.details.take() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        details.insert("port".into(), json!(port));
        details.insert("states".into(), json!(trail.0));
        if result.status != Status::Pass {
            details.insert("log_excerpt".into(), json!(excerpt));
        }
        Ok(result.with_details(serde_json::Value::Object(details)))
    }
}
