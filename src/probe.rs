use crate::{cancel::CancelToken, registry::ChartRegistry};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pass,
    Warn,
    Fail,
    Skipped,
}

impl Status {
    /// Severity order used when folding several findings into one status.
    fn rank(self) -> u8 {
        match self {
            Status::Skipped => 0,
            Status::Pass => 1,
            Status::Warn => 2,
            Status::Fail => 3,
        }
    }

    pub fn worst(self, other: Status) -> Status {
        if other.rank() > self.rank() { other } else { self }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pass => "pass",
            Status::Warn => "warn",
            Status::Fail => "fail",
            Status::Skipped => "skipped",
        }
    }
}

/// Outcome of one probe invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub status: Status,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl ProbeResult {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            messages: Vec::new(),
            artifacts: BTreeMap::new(),
            metrics: BTreeMap::new(),
            details: serde_json::Value::Null,
        }
    }

    pub fn pass() -> Self {
        Self::new(Status::Pass)
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::new(Status::Skipped).with_message(reason)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(Status::Fail).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn with_metric(mut self, key: &str, value: f64) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    pub fn with_artifact(mut self, kind: &str, path: impl Into<PathBuf>) -> Self {
        self.artifacts.insert(kind.to_string(), path.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// The pipeline phases in canonical order: each is more expensive than the
/// one before and assumes it succeeded at the syntactic level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    Check,
    AppRun,
    VisualValidation,
    Run,
    Ui,
    Mcp,
}

impl PhaseId {
    pub const CANONICAL: [PhaseId; 6] = [
        PhaseId::Check,
        PhaseId::AppRun,
        PhaseId::VisualValidation,
        PhaseId::Run,
        PhaseId::Ui,
        PhaseId::Mcp,
    ];

    /// Field name in the persisted report.
    pub fn key(self) -> &'static str {
        match self {
            PhaseId::Check => "check",
            PhaseId::AppRun => "app_run",
            PhaseId::VisualValidation => "visual_validation",
            PhaseId::Run => "run",
            PhaseId::Ui => "ui",
            PhaseId::Mcp => "mcp",
        }
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseConfig {
    pub enabled: bool,
    /// Warnings become failures for this phase only.
    pub strict: bool,
    pub timeout: Duration,
}

impl PhaseConfig {
    pub fn new(enabled: bool, strict: bool, timeout: Duration) -> Self {
        Self {
            enabled,
            strict,
            timeout,
        }
    }

    /// Status for a finding that is a failure under strict mode and a warning otherwise.
    pub fn finding(&self) -> Status {
        if self.strict { Status::Fail } else { Status::Warn }
    }
}

/// Everything a probe may touch during one phase.
#[derive(Clone)]
pub struct PhaseContext {
    pub phase: PhaseId,
    pub notebook: PathBuf,
    pub project_root: PathBuf,
    pub config: PhaseConfig,
    pub registry: Arc<ChartRegistry>,
    /// Cancelled on external interrupt and when the phase times out.
    pub cancel: CancelToken,
    pub deadline: Instant,
}

impl PhaseContext {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

pub trait Probe: Send + Sync {
    fn run(&self, ctx: &PhaseContext) -> Result<ProbeResult>;
}
