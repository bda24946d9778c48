//! Versioned verdict document.
//!
//! The schema is additive-only: new optional fields may appear, and
//! `SCHEMA_VERSION` is bumped on any removal or change of meaning. Readers
//! ignore fields they do not know.

use crate::{
    error::{EXIT_CHECK_FAILED, EXIT_OK, GuardError},
    pipeline::PhaseOutcome,
    policy::{self, PolicyDecision},
    probe::{PhaseId, Status},
    selftest::SelfTest,
    util::{ensure_dir, notebook_key},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: &str = "1.1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub status: Status,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl Default for PhaseReport {
    fn default() -> Self {
        Self {
            status: Status::Skipped,
            strict: false,
            messages: vec!["phase not scheduled".to_string()],
            artifacts: BTreeMap::new(),
            metrics: BTreeMap::new(),
            duration_ms: 0,
            details: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub schema_version: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub promoted: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub check: PhaseReport,
    #[serde(default)]
    pub app_run: PhaseReport,
    #[serde(default)]
    pub visual_validation: PhaseReport,
    #[serde(default)]
    pub run: PhaseReport,
    #[serde(default)]
    pub ui: PhaseReport,
    #[serde(default)]
    pub mcp: PhaseReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selftest: Option<SelfTest>,
}

/// Run metadata copied into the report verbatim.
#[derive(Debug, Clone, Default)]
pub struct RunMeta {
    pub notebook: Option<String>,
    pub notebook_sha256: Option<String>,
    pub generated_at: Option<String>,
    pub duration_ms: u64,
}

/// What the run learned about the self-test artifact.
#[derive(Debug, Clone)]
pub enum SelfTestInput {
    Absent { expected_at: PathBuf },
    Present(SelfTest),
}

impl SelfTestInput {
    fn as_selftest(&self) -> Option<&SelfTest> {
        match self {
            SelfTestInput::Present(st) => Some(st),
            SelfTestInput::Absent { .. } => None,
        }
    }
}

impl Report {
    pub fn phase(&self, phase: PhaseId) -> &PhaseReport {
        match phase {
            PhaseId::Check => &self.check,
            PhaseId::AppRun => &self.app_run,
            PhaseId::VisualValidation => &self.visual_validation,
            PhaseId::Run => &self.run,
            PhaseId::Ui => &self.ui,
            PhaseId::Mcp => &self.mcp,
        }
    }

    fn phase_mut(&mut self, phase: PhaseId) -> &mut PhaseReport {
        match phase {
            PhaseId::Check => &mut self.check,
            PhaseId::AppRun => &mut self.app_run,
            PhaseId::VisualValidation => &mut self.visual_validation,
            PhaseId::Run => &mut self.run,
            PhaseId::Ui => &mut self.ui,
            PhaseId::Mcp => &mut self.mcp,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.ok { EXIT_OK } else { EXIT_CHECK_FAILED }
    }

    /// Human-oriented digest of why a report is not ok.
    pub fn failure_summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(err) = &self.error {
            parts.push(format!("error: {err}"));
        }
        for phase in PhaseId::CANONICAL {
            let p = self.phase(phase);
            if p.status == Status::Fail {
                let msgs = if p.messages.is_empty() {
                    "failed".to_string()
                } else {
                    p.messages.join("; ")
                };
                parts.push(format!("{phase}: {msgs}"));
            }
        }
        if let Some(st) = &self.selftest {
            if !st.ok && !st.errors.is_empty() {
                parts.push(format!("selftest: {}", st.errors.join("; ")));
            }
        }
        parts.join("\n")
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("writing report: {}", path.display()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading report: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing report: {}", path.display()))
    }
}

pub fn report_path(logs_dir: &Path, notebook: &Path) -> PathBuf {
    logs_dir.join(format!("marimo_guard_{}.json", notebook_key(notebook)))
}

pub fn iteration_report_path(logs_dir: &Path, notebook: &Path, iteration: u32) -> PathBuf {
    logs_dir.join(format!(
        "marimo_guard_iter_{}_{iteration}.json",
        notebook_key(notebook)
    ))
}

/// Fold ordered phase outcomes and the self-test artifact into one report.
///
/// `ok` holds iff no phase ends up `fail` after strict promotion and, when
/// `require_selftest` is set, the artifact exists and says `ok`. A missing
/// required artifact is reported as the top-level `error`.
pub fn aggregate(
    outcomes: Vec<PhaseOutcome>,
    selftest: SelfTestInput,
    require_selftest: bool,
    meta: RunMeta,
) -> Result<Report, GuardError> {
    let mut seen = HashSet::new();
    for o in &outcomes {
        if !seen.insert(o.phase) {
            return Err(GuardError::AggregationFatal(format!(
                "phase {} reported more than once",
                o.phase
            )));
        }
    }

    let PolicyDecision {
        phases_ok,
        statuses,
        promoted,
        mut warnings,
    } = policy::decide(&outcomes);

    let mut error = None;
    let selftest_ok = match (&selftest, require_selftest) {
        (SelfTestInput::Absent { expected_at }, true) => {
            error = Some(GuardError::ArtifactMissing(expected_at.clone()).to_string());
            false
        }
        (SelfTestInput::Present(st), true) => st.ok,
        (SelfTestInput::Present(st), false) => {
            if !st.ok {
                warnings.extend(st.errors.iter().map(|e| format!("selftest: {e}")));
            }
            true
        }
        (SelfTestInput::Absent { .. }, false) => true,
    };

    let mut report = Report {
        schema_version: SCHEMA_VERSION.to_string(),
        ok: phases_ok && selftest_ok && error.is_none(),
        error,
        warnings,
        promoted,
        notebook: meta.notebook,
        notebook_sha256: meta.notebook_sha256,
        generated_at: meta.generated_at,
        duration_ms: meta.duration_ms,
        check: PhaseReport::default(),
        app_run: PhaseReport::default(),
        visual_validation: PhaseReport::default(),
        run: PhaseReport::default(),
        ui: PhaseReport::default(),
        mcp: PhaseReport::default(),
        selftest: selftest.as_selftest().cloned(),
    };

    for (o, (phase, status)) in outcomes.into_iter().zip(statuses) {
        *report.phase_mut(phase) = PhaseReport {
            status,
            strict: o.config.strict,
            messages: o.result.messages,
            artifacts: o.result.artifacts,
            metrics: o.result.metrics,
            duration_ms: u64::try_from(o.duration.as_millis()).unwrap_or(u64::MAX),
            details: o.result.details,
        };
    }

    Ok(report)
}
