use crate::{
    cancel::CancelToken,
    config::Config,
    engine::{NotebookEngine, python::PythonEngine},
    error::GuardError,
    mcp::{HttpClient, HttpConfig, McpClient, SessionClient},
    policy,
    preview::{MarimoPreviewLauncher, PreviewLauncher},
    probe::{PhaseConfig, PhaseContext, PhaseId, Probe, ProbeResult, Status},
    probes::{
        ExecutionProbe, SessionQueryProbe, SmokeProbe, StaticCheckProbe, UiVerifier,
        VisualValidator, ui::UiOptions,
    },
    registry::ChartRegistry,
    report::{self, Report, RunMeta, SelfTestInput},
    selftest::{self, SelfTest},
    util::{fmt_duration, hash_file, now_rfc3339, project_root},
};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a timed-out or cancelled probe gets to release its resources.
const RELEASE_GRACE: Duration = Duration::from_secs(5);

/// One scheduled phase.
#[derive(Clone)]
pub struct Phase {
    pub id: PhaseId,
    pub probe: Arc<dyn Probe>,
    pub config: PhaseConfig,
}

/// Result of one phase as recorded by the orchestrator.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub phase: PhaseId,
    pub config: PhaseConfig,
    pub result: ProbeResult,
    pub duration: Duration,
}

/// Runs phases one after another, each bounded by its own timeout.
///
/// A probe that errors, panics or overruns its timeout yields a `fail` result
/// for its phase only. The only error that escapes `run` is cancellation.
pub struct Orchestrator {
    registry: Arc<ChartRegistry>,
}

impl Orchestrator {
    pub fn new(registry: Arc<ChartRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ChartRegistry> {
        &self.registry
    }

    pub fn run(
        &self,
        phases: Vec<Phase>,
        notebook: &Path,
        project_root: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<PhaseOutcome>> {
        self.registry.clear();
        let mut outcomes = Vec::with_capacity(phases.len());
        let mut check_failed = false;

        for phase in phases {
            if cancel.is_cancelled() {
                return Err(GuardError::Cancelled.into());
            }
            let started = Instant::now();
            let result = if check_failed {
                ProbeResult::skipped("skipped: static check failed")
            } else if !phase.config.enabled {
                ProbeResult::skipped("disabled")
            } else {
                info!(phase = %phase.id, timeout = ?phase.config.timeout, "phase start");
                self.run_phase(&phase, notebook, project_root, cancel)?
            };
            let duration = started.elapsed();

            if phase.id == PhaseId::Check
                && policy::effective_status(&result, &phase.config) == Status::Fail
            {
                check_failed = true;
            }
            if result.status != Status::Skipped {
                info!(
                    phase = %phase.id,
                    status = result.status.as_str(),
                    duration_ms = duration.as_millis() as u64,
                    "phase done"
                );
            }
            outcomes.push(PhaseOutcome {
                phase: phase.id,
                config: phase.config,
                result,
                duration,
            });
        }
        Ok(outcomes)
    }

    fn run_phase(
        &self,
        phase: &Phase,
        notebook: &Path,
        project_root: &Path,
        cancel: &CancelToken,
    ) -> Result<ProbeResult> {
        let timeout = phase.config.timeout;
        let phase_cancel = cancel.child();
        let ctx = PhaseContext {
            phase: phase.id,
            notebook: notebook.to_path_buf(),
            project_root: project_root.to_path_buf(),
            config: phase.config,
            registry: Arc::clone(&self.registry),
            cancel: phase_cancel.clone(),
            deadline: Instant::now() + timeout,
        };

        let (tx, rx) = mpsc::channel();
        let probe = Arc::clone(&phase.probe);
        let worker = std::thread::Builder::new()
            .name(format!("phase-{}", phase.id))
            .spawn(move || {
                let _ = tx.send(probe.run(&ctx));
            })
            .map_err(|e| GuardError::ProbeCrash {
                phase: phase.id.to_string(),
                message: format!("spawning phase thread: {e}"),
            })?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(result)) => {
                let _ = worker.join();
                Ok(result)
            }
            Ok(Err(err)) => {
                let _ = worker.join();
                if cancel.is_cancelled() {
                    return Err(GuardError::Cancelled.into());
                }
                if let Some(GuardError::ProbeTimeout { .. }) = err.downcast_ref::<GuardError>() {
                    warn!(phase = %phase.id, "phase subprocess overran its budget");
                    return Ok(ProbeResult::fail(format!(
                        "timeout after {}",
                        fmt_duration(timeout)
                    )));
                }
                let crash = GuardError::ProbeCrash {
                    phase: phase.id.to_string(),
                    message: format!("{err:#}"),
                };
                warn!("{crash}");
                Ok(ProbeResult::fail(format!("{err:#}")))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let overrun = GuardError::ProbeTimeout {
                    phase: phase.id.to_string(),
                    timeout,
                };
                warn!("{overrun}");
                phase_cancel.cancel();
                if rx.recv_timeout(RELEASE_GRACE).is_err() {
                    debug!(phase = %phase.id, "probe still running after cancel; detaching");
                }
                if cancel.is_cancelled() {
                    return Err(GuardError::Cancelled.into());
                }
                Ok(ProbeResult::fail(format!(
                    "timeout after {}",
                    fmt_duration(timeout)
                )))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let message = match worker.join() {
                    Err(payload) => panic_text(payload.as_ref()),
                    Ok(()) => "probe exited without a result".to_string(),
                };
                let crash = GuardError::ProbeCrash {
                    phase: phase.id.to_string(),
                    message: message.clone(),
                };
                warn!("{crash}");
                Ok(ProbeResult::fail(format!("probe panicked: {message}")))
            }
        }
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Adapters the probes talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn NotebookEngine>,
    pub launcher: Arc<dyn PreviewLauncher>,
    pub sessions: Arc<dyn SessionClient>,
}

impl Collaborators {
    /// The real marimo-backed adapters.
    pub fn marimo(cfg: &Config, project_root: &Path) -> Self {
        let engine = PythonEngine::new(cfg);
        let launcher = MarimoPreviewLauncher::new(
            engine.marimo().clone(),
            project_root.join(&cfg.paths.logs_dir),
        );
        let http = HttpClient::new(HttpConfig {
            timeout: Duration::from_secs(cfg.mcp.connect_timeout_seconds),
            max_retries: cfg.mcp.max_retries,
            ..HttpConfig::default()
        });
        Self {
            engine: Arc::new(engine),
            launcher: Arc::new(launcher),
            sessions: Arc::new(McpClient::new(&cfg.mcp.url, http)),
        }
    }
}

/// One full validation run: phases, self-test, aggregation, persisted report.
pub struct Pipeline {
    cfg: Config,
    parts: Collaborators,
    orchestrator: Orchestrator,
}

impl Pipeline {
    pub fn new(cfg: &Config, parts: Collaborators) -> Self {
        Self {
            cfg: cfg.clone(),
            parts,
            orchestrator: Orchestrator::new(Arc::new(ChartRegistry::new())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn logs_dir(&self, notebook: &Path) -> PathBuf {
        project_root(notebook).join(&self.cfg.paths.logs_dir)
    }

    pub fn report_path(&self, notebook: &Path) -> PathBuf {
        report::report_path(&self.logs_dir(notebook), notebook)
    }

    /// Phases in canonical order, each resolved against the config.
    pub fn phases(&self) -> Vec<Phase> {
        let cfg = &self.cfg;
        let p = &self.parts;
        PhaseId::CANONICAL
            .into_iter()
            .map(|id| {
                let probe: Arc<dyn Probe> = match id {
                    PhaseId::Check => Arc::new(StaticCheckProbe::new(Arc::clone(&p.engine))),
                    PhaseId::AppRun => Arc::new(ExecutionProbe::new(Arc::clone(&p.engine))),
                    PhaseId::VisualValidation => {
                        Arc::new(VisualValidator::new(Arc::clone(&p.engine)))
                    }
                    PhaseId::Run => Arc::new(SmokeProbe::new(
                        Arc::clone(&p.launcher),
                        Duration::from_secs(cfg.smoke.seconds),
                        cfg.smoke.port,
                    )),
                    PhaseId::Ui => Arc::new(UiVerifier::new(
                        Arc::clone(&p.engine),
                        Arc::clone(&p.launcher),
                        UiOptions::from_config(&cfg.ui, Path::new(&cfg.paths.logs_dir)),
                    )),
                    PhaseId::Mcp => Arc::new(SessionQueryProbe::new(
                        Arc::clone(&p.sessions),
                        Duration::from_secs(cfg.mcp.wait_seconds),
                    )),
                };
                Phase {
                    id,
                    probe,
                    config: cfg.phase_config(id),
                }
            })
            .collect()
    }

    pub fn run(&self, notebook: &Path, cancel: &CancelToken) -> Result<Report> {
        if !notebook.is_file() {
            return Err(GuardError::ConfigInvalid(format!(
                "notebook not found: {}",
                notebook.display()
            ))
            .into());
        }
        let started = Instant::now();
        let root = project_root(notebook);
        let logs_dir = root.join(&self.cfg.paths.logs_dir);
        let selftest_path = selftest::artifact_path(&logs_dir, notebook);
        if self.cfg.selftest.clear_stale {
            selftest::clear(&selftest_path)?;
        }

        info!(notebook = %notebook.display(), root = %root.display(), "validation run");
        let outcomes = self
            .orchestrator
            .run(self.phases(), notebook, &root, cancel)?;

        let selftest = match selftest::read(&selftest_path) {
            Ok(Some(st)) => SelfTestInput::Present(st),
            Ok(None) => SelfTestInput::Absent {
                expected_at: selftest_path.clone(),
            },
            Err(e) => {
                warn!("unreadable selftest artifact: {e:#}");
                SelfTestInput::Present(SelfTest {
                    ok: false,
                    errors: vec![format!("{e:#}")],
                })
            }
        };

        let notebook_sha256 = match hash_file(notebook) {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("hashing notebook failed: {e:#}");
                None
            }
        };
        let meta = RunMeta {
            notebook: Some(notebook.display().to_string()),
            notebook_sha256,
            generated_at: Some(now_rfc3339()),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        let report = report::aggregate(outcomes, selftest, self.cfg.selftest.require, meta)?;

        if self.cfg.output.write_report {
            let path = report::report_path(&logs_dir, notebook);
            report.write(&path)?;
            debug!(path = %path.display(), "report written");
        }
        info!(ok = report.ok, "validation finished");
        Ok(report)
    }
}
