use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure classes the guard distinguishes.
///
/// `ProbeTimeout` and `ProbeCrash` never leave the orchestrator: they are
/// folded into a `fail` phase result. The remaining variants cross the
/// library boundary and decide the process exit code.
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("phase {phase} timed out after {}", crate::util::fmt_duration(*.timeout))]
    ProbeTimeout { phase: String, timeout: Duration },
    #[error("phase {phase} crashed: {message}")]
    ProbeCrash { phase: String, message: String },
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("selftest artifact missing: {}", .0.display())]
    ArtifactMissing(PathBuf),
    #[error("report aggregation failed: {0}")]
    AggregationFatal(String),
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    #[error("cancelled")]
    Cancelled,
}

pub const EXIT_OK: i32 = 0;
pub const EXIT_CHECK_FAILED: i32 = 1;
pub const EXIT_CONFIG_INVALID: i32 = 2;
pub const EXIT_AGGREGATION_FATAL: i32 = 3;
pub const EXIT_LAUNCH_FAILED: i32 = 4;
pub const EXIT_CANCELLED: i32 = 130;

impl GuardError {
    pub fn exit_code(&self) -> i32 {
        match self {
            GuardError::ConfigInvalid(_) => EXIT_CONFIG_INVALID,
            GuardError::AggregationFatal(_) => EXIT_AGGREGATION_FATAL,
            GuardError::LaunchFailed(_) => EXIT_LAUNCH_FAILED,
            GuardError::Cancelled => EXIT_CANCELLED,
            GuardError::ProbeTimeout { .. }
            | GuardError::ProbeCrash { .. }
            | GuardError::ArtifactMissing(_) => EXIT_CHECK_FAILED,
        }
    }

    /// Map any error coming out of a command to its exit code.
    pub fn exit_code_for(err: &anyhow::Error) -> i32 {
        err.chain()
            .find_map(|e| e.downcast_ref::<GuardError>())
            .map(GuardError::exit_code)
            .unwrap_or(EXIT_CHECK_FAILED)
    }
}
