//! Bounded retry driver around a validation run.

use crate::{
    cancel::CancelToken,
    engine::python::wait_with_timeout,
    error::GuardError,
    report::{Report, iteration_report_path},
    util::tail,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppedReason {
    Success,
    MaxIters,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    Running,
    Retrying,
    Succeeded,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryRecord {
    pub iteration: u32,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoopState {
    /// Zero-based index of the iteration that ran last.
    pub iteration: u32,
    pub phase: LoopPhase,
    pub last_report: Option<Report>,
    pub stopped_reason: Option<StoppedReason>,
    pub recoveries: Vec<RecoveryRecord>,
}

impl LoopState {
    fn new() -> Self {
        Self {
            iteration: 0,
            phase: LoopPhase::Idle,
            last_report: None,
            stopped_reason: None,
            recoveries: Vec::new(),
        }
    }

    fn stop(mut self, phase: LoopPhase, reason: StoppedReason) -> Self {
        debug!(?phase, ?reason, iteration = self.iteration, "guard loop stopped");
        self.phase = phase;
        self.stopped_reason = Some(reason);
        self
    }

    pub fn succeeded(&self) -> bool {
        self.stopped_reason == Some(StoppedReason::Success)
    }
}

/// Something to run between a failing iteration and the next one.
pub trait RecoveryHook: Send + Sync {
    /// Returns the hook's exit code when it has one.
    fn recover(
        &self,
        iteration: u32,
        report_path: Option<&Path>,
        cancel: &CancelToken,
    ) -> Result<Option<i32>>;
}

/// Runs a shell command via `bash -lc`, `{nb}` replaced by the notebook path
/// and `ERR_JSON` pointing at the failing iteration's report.
pub struct ShellRecovery {
    template: String,
    notebook: PathBuf,
    timeout: Duration,
}

impl ShellRecovery {
    pub fn new(template: &str, notebook: &Path, timeout: Duration) -> Self {
        Self {
            template: template.to_string(),
            notebook: notebook.to_path_buf(),
            timeout,
        }
    }

    pub fn command_line(&self) -> String {
        let quoted = format!(
            "'{}'",
            self.notebook.display().to_string().replace('\'', r"'\''")
        );
        self.template.replace("{nb}", &quoted)
    }
}

impl RecoveryHook for ShellRecovery {
    fn recover(
        &self,
        iteration: u32,
        report_path: Option<&Path>,
        cancel: &CancelToken,
    ) -> Result<Option<i32>> {
        let line = self.command_line();
        info!(iteration, cmd = %line, "running recovery command");
        let mut cmd = Command::new("bash");
        cmd.arg("-lc").arg(&line);
        if let Some(p) = report_path {
            cmd.env("ERR_JSON", p);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().with_context(|| "spawning recovery command")?;
        let output = wait_with_timeout(&mut child, self.timeout, cancel)?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!("recovery stderr: {}", tail(stderr.trim(), 2000));
        }
        Ok(output.status.code())
    }
}

pub struct GuardLoop {
    max_iters: u32,
    sleep: Duration,
    recovery: Option<Box<dyn RecoveryHook>>,
    /// Where per-iteration reports go, if anywhere.
    iteration_reports: Option<(PathBuf, PathBuf)>,
}

impl GuardLoop {
    pub fn new(max_iters: u32, sleep: Duration) -> Self {
        Self {
            max_iters,
            sleep,
            recovery: None,
            iteration_reports: None,
        }
    }

    pub fn with_recovery(mut self, hook: Box<dyn RecoveryHook>) -> Self {
        self.recovery = Some(hook);
        self
    }

    pub fn with_iteration_reports(mut self, logs_dir: &Path, notebook: &Path) -> Self {
        self.iteration_reports = Some((logs_dir.to_path_buf(), notebook.to_path_buf()));
        self
    }

    /// Call `run_once` until it yields an ok report or the iterations run out.
    ///
    /// Cancellation stops the loop with `StoppedReason::External`; any other
    /// error from `run_once` aborts the loop.
    pub fn run<F>(&self, mut run_once: F, cancel: &CancelToken) -> Result<LoopState>
    where
        F: FnMut(u32) -> Result<Report>,
    {
        if self.max_iters == 0 {
            return Err(GuardError::ConfigInvalid("max_iters must be at least 1".into()).into());
        }
        let mut state = LoopState::new();

        for iteration in 0..self.max_iters {
            if cancel.is_cancelled() {
                return Ok(state.stop(LoopPhase::Idle, StoppedReason::External));
            }
            state.iteration = iteration;
            state.phase = LoopPhase::Running;
            info!(iteration = iteration + 1, max = self.max_iters, "guard iteration");

            let report = match run_once(iteration) {
                Ok(r) => r,
                Err(e) if is_cancelled(&e) => {
                    return Ok(state.stop(LoopPhase::Running, StoppedReason::External));
                }
                Err(e) => return Err(e),
            };

            let report_path = match &self.iteration_reports {
                Some((logs_dir, notebook)) => {
                    let path = iteration_report_path(logs_dir, notebook, iteration + 1);
                    report.write(&path)?;
                    Some(path)
                }
                None => None,
            };

            if report.ok {
                state.last_report = Some(report);
                return Ok(state.stop(LoopPhase::Succeeded, StoppedReason::Success));
            }
            error!(
                iteration = iteration + 1,
                "guard iteration failed:\n{}",
                report.failure_summary()
            );
            state.last_report = Some(report);

            if iteration + 1 >= self.max_iters {
                return Ok(state.stop(LoopPhase::Exhausted, StoppedReason::MaxIters));
            }

            state.phase = LoopPhase::Retrying;
            if let Some(hook) = &self.recovery {
                let record = match hook.recover(iteration, report_path.as_deref(), cancel) {
                    Ok(code) => RecoveryRecord {
                        iteration,
                        exit_code: code,
                        error: None,
                    },
                    Err(e) if is_cancelled(&e) => {
                        return Ok(state.stop(LoopPhase::Retrying, StoppedReason::External));
                    }
                    Err(e) => {
                        warn!(iteration, "recovery command failed: {e:#}");
                        RecoveryRecord {
                            iteration,
                            exit_code: None,
                            error: Some(format!("{e:#}")),
                        }
                    }
                };
                state.recoveries.push(record);
            }
            if !cancel.sleep(self.sleep) {
                return Ok(state.stop(LoopPhase::Retrying, StoppedReason::External));
            }
        }

        Ok(state.stop(LoopPhase::Exhausted, StoppedReason::MaxIters))
    }
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<GuardError>(), Some(GuardError::Cancelled))
}
