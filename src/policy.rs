use crate::{
    pipeline::PhaseOutcome,
    probe::{PhaseConfig, PhaseId, ProbeResult, Status},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// No phase ended up `fail` after promotion.
    pub phases_ok: bool,
    /// Status per phase after strict-mode promotion, canonical order preserved.
    pub statuses: Vec<(PhaseId, Status)>,
    /// Warn-level messages that strict mode turned into failures.
    pub promoted: Vec<String>,
    /// Warn-level messages from advisory phases.
    pub warnings: Vec<String>,
}

/// Strict phases treat their warnings as failures; everything else is advisory.
pub fn effective_status(result: &ProbeResult, cfg: &PhaseConfig) -> Status {
    match result.status {
        Status::Warn if cfg.strict => Status::Fail,
        other => other,
    }
}

pub fn decide(outcomes: &[PhaseOutcome]) -> PolicyDecision {
    let mut statuses = Vec::with_capacity(outcomes.len());
    let mut promoted = Vec::new();
    let mut warnings = Vec::new();
    let mut phases_ok = true;

    for o in outcomes {
        let status = effective_status(&o.result, &o.config);
        let prefixed = o.result.messages.iter().map(|m| format!("{}: {m}", o.phase));
        match (o.result.status, status) {
            (Status::Warn, Status::Fail) => promoted.extend(prefixed),
            (Status::Warn, Status::Warn) => warnings.extend(prefixed),
            _ => {}
        }
        if status == Status::Fail {
            phases_ok = false;
        }
        statuses.push((o.phase, status));
    }

    PolicyDecision {
        phases_ok,
        statuses,
        promoted,
        warnings,
    }
}
