use crate::{
    cancel::CancelToken,
    config::Config,
    engine::python::MarimoCommand,
    error::{EXIT_CANCELLED, EXIT_CHECK_FAILED, EXIT_OK, GuardError},
    guard_loop::{GuardLoop, ShellRecovery, StoppedReason},
    pipeline::{Collaborators, Pipeline},
    preview::{MarimoPreviewLauncher, spawn_editor},
    report::Report,
    util::{ensure_dir, pick_free_port, project_root},
    watch::WatchController,
};
use anyhow::{Context, Result, anyhow};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_EDIT_PORT: u16 = 2731;

#[derive(Parser, Debug)]
#[command(name = "marimo-guard")]
#[command(about = "Pre-launch validation for marimo notebooks (check, loop, watch)")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, looks for .marimo-guard.toml or
    /// marimo-guard.toml in the notebook's project root.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the validation pipeline once.
    Check {
        notebook: PathBuf,
        #[command(flatten)]
        phases: PhaseFlags,
        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
        /// Open the notebook in the editor when the report is ok.
        #[arg(long)]
        launch: bool,
        /// Editor port for --launch.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Re-run the pipeline until it passes or the iterations run out.
    Loop {
        notebook: PathBuf,
        #[command(flatten)]
        phases: PhaseFlags,
        #[arg(long)]
        max_iters: Option<u32>,
        #[arg(long)]
        sleep_seconds: Option<u64>,
        /// Shell command run after a failing iteration; `{nb}` is the notebook.
        #[arg(long)]
        recovery_cmd: Option<String>,
    },
    /// Keep an editor preview up and re-validate on every change.
    Watch {
        notebook: PathBuf,
        #[command(flatten)]
        phases: PhaseFlags,
        #[arg(long)]
        port: Option<u16>,
        /// Append preview output to this file.
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Restart the preview on change without running the pipeline.
        #[arg(long)]
        no_validate: bool,
    },
}

/// Per-phase toggles shared by every command.
#[derive(ClapArgs, Debug, Default, Clone)]
pub struct PhaseFlags {
    /// Treat static-check warnings as failures.
    #[arg(long)]
    pub fail_on_warn: bool,
    #[arg(long)]
    pub visual_strict: bool,
    #[arg(long)]
    pub smoke_strict: bool,
    #[arg(long)]
    pub no_visual: bool,
    #[arg(long)]
    pub no_smoke: bool,
    #[arg(long)]
    pub smoke_seconds: Option<u64>,
    /// Enable live UI verification.
    #[arg(long)]
    pub ui: bool,
    #[arg(long)]
    pub ui_strict: bool,
    #[arg(long)]
    pub ui_port: Option<u16>,
    #[arg(long)]
    pub ui_timeout: Option<u64>,
    /// Query the running notebook server for errors.
    #[arg(long)]
    pub mcp: bool,
    #[arg(long)]
    pub mcp_strict: bool,
    #[arg(long)]
    pub mcp_url: Option<String>,
    #[arg(long)]
    pub check_timeout: Option<u64>,
    #[arg(long)]
    pub app_run_timeout: Option<u64>,
    #[arg(long)]
    pub visual_timeout: Option<u64>,
    #[arg(long)]
    pub smoke_timeout: Option<u64>,
    #[arg(long)]
    pub require_selftest: bool,
    #[arg(long)]
    pub no_require_selftest: bool,
}

impl PhaseFlags {
    /// Flags win over everything below them; unset flags change nothing.
    pub fn apply(&self, cfg: &mut Config) {
        if self.fail_on_warn {
            cfg.check.strict = true;
        }
        if self.visual_strict {
            cfg.visual.strict = true;
        }
        if self.smoke_strict {
            cfg.smoke.strict = true;
        }
        if self.no_visual {
            cfg.visual.enabled = false;
        }
        if self.no_smoke {
            cfg.smoke.enabled = false;
        }
        if let Some(s) = self.smoke_seconds {
            cfg.smoke.seconds = s;
        }
        if self.ui || self.ui_strict || self.ui_port.is_some() {
            cfg.ui.enabled = true;
        }
        if self.ui_strict {
            cfg.ui.strict = true;
        }
        if let Some(p) = self.ui_port {
            cfg.ui.port = Some(p);
        }
        if let Some(t) = self.ui_timeout {
            cfg.ui.timeout_seconds = t;
        }
        if self.mcp || self.mcp_strict {
            cfg.mcp.enabled = true;
        }
        if self.mcp_strict {
            cfg.mcp.strict = true;
        }
        if let Some(url) = &self.mcp_url {
            cfg.mcp.url = url.clone();
        }
        if let Some(t) = self.check_timeout {
            cfg.check.timeout_seconds = t;
        }
        if let Some(t) = self.app_run_timeout {
            cfg.app_run.timeout_seconds = t;
        }
        if let Some(t) = self.visual_timeout {
            cfg.visual.timeout_seconds = t;
        }
        if let Some(t) = self.smoke_timeout {
            cfg.smoke.timeout_seconds = t;
        }
        if self.require_selftest {
            cfg.selftest.require = true;
        }
        if self.no_require_selftest {
            cfg.selftest.require = false;
        }
    }
}

impl Command {
    fn notebook(&self) -> &Path {
        match self {
            Command::Check { notebook, .. }
            | Command::Loop { notebook, .. }
            | Command::Watch { notebook, .. } => notebook,
        }
    }

    fn phases(&self) -> &PhaseFlags {
        match self {
            Command::Check { phases, .. }
            | Command::Loop { phases, .. }
            | Command::Watch { phases, .. } => phases,
        }
    }
}

/// Run one command; the returned value is the process exit code.
pub fn dispatch(args: Args, cancel: &CancelToken) -> Result<i32> {
    let notebook = args.cmd.notebook().to_path_buf();
    let cfg = resolve_config(&args, &notebook, |k| std::env::var(k).ok())?;
    let root = project_root(&notebook);
    let log_path = resolve_log_path(&cfg, &root);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
    info!(notebook = %notebook.display(), "marimo-guard");

    match &args.cmd {
        Command::Check {
            json, launch, port, ..
        } => check(&cfg, &notebook, *json, *launch, *port, cancel),
        Command::Loop { .. } => guard_loop(&cfg, &notebook, cancel),
        Command::Watch { no_validate, .. } => watch(&cfg, &notebook, *no_validate, cancel),
    }
}

/// Defaults, then the config file, then `MARIMO_GUARD_*`, then flags.
pub fn resolve_config<F>(args: &Args, notebook: &Path, env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let path = match &args.config {
        Some(p) => Some(p.clone()),
        None => Config::discover(&project_root(notebook)),
    };
    let mut cfg = match path {
        Some(p) => Config::load(&p)
            .map_err(|e| GuardError::ConfigInvalid(format!("{e:#}")))?,
        None => Config::default(),
    };
    cfg.apply_env(env);
    args.cmd.phases().apply(&mut cfg);
    match &args.cmd {
        Command::Check { json, .. } => {
            if *json {
                cfg.output.json = true;
            }
        }
        Command::Loop {
            max_iters,
            sleep_seconds,
            recovery_cmd,
            ..
        } => {
            if let Some(n) = max_iters {
                cfg.guard_loop.max_iters = *n;
            }
            if let Some(s) = sleep_seconds {
                cfg.guard_loop.sleep_seconds = *s;
            }
            if let Some(c) = recovery_cmd {
                cfg.guard_loop.recovery_cmd = c.clone();
            }
        }
        Command::Watch { port, log_file, .. } => {
            if let Some(p) = port {
                cfg.watch.port = *p;
            }
            if let Some(f) = log_file {
                cfg.watch.log_file = f.display().to_string();
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Report JSON owns stdout; logs go to stderr.
    let stderr_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config, root: &Path) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(root.join(&cfg.paths.logs_dir).join("marimo-guard.log"))
}

fn pipeline(cfg: &Config, notebook: &Path) -> Pipeline {
    Pipeline::new(cfg, Collaborators::marimo(cfg, &project_root(notebook)))
}

fn print_report(report: &Report, json: bool, path: Option<&Path>) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if report.ok {
        println!("OK");
    } else {
        println!("FAILED\n{}", report.failure_summary());
    }
    for w in &report.warnings {
        println!("warning: {w}");
    }
    if let Some(p) = path {
        println!("report: {}", p.display());
    }
    Ok(())
}

fn check(
    cfg: &Config,
    notebook: &Path,
    json: bool,
    launch: bool,
    port: Option<u16>,
    cancel: &CancelToken,
) -> Result<i32> {
    let pipeline = pipeline(cfg, notebook);
    let report = pipeline.run(notebook, cancel)?;
    let path = cfg.output.write_report.then(|| pipeline.report_path(notebook));
    print_report(&report, json || cfg.output.json, path.as_deref())?;
    if !report.ok {
        return Ok(report.exit_code());
    }
    if launch {
        let marimo = MarimoCommand::from_config(cfg);
        let port = match port {
            Some(p) => p,
            None => pick_free_port(Some(DEFAULT_EDIT_PORT))?,
        };
        let (url, pid) = spawn_editor(&marimo, notebook, port)
            .map_err(|e| GuardError::LaunchFailed(format!("{e:#}")))?;
        info!(pid, %url, "editor launched");
        println!("launched: {url}");
    }
    Ok(EXIT_OK)
}

fn guard_loop(cfg: &Config, notebook: &Path, cancel: &CancelToken) -> Result<i32> {
    let pipeline = pipeline(cfg, notebook);
    let mut driver = GuardLoop::new(
        cfg.guard_loop.max_iters,
        Duration::from_secs(cfg.guard_loop.sleep_seconds),
    );
    if cfg.output.write_iteration_reports {
        driver = driver.with_iteration_reports(&pipeline.logs_dir(notebook), notebook);
    }
    if !cfg.guard_loop.recovery_cmd.trim().is_empty() {
        driver = driver.with_recovery(Box::new(ShellRecovery::new(
            &cfg.guard_loop.recovery_cmd,
            notebook,
            Duration::from_secs(cfg.guard_loop.recovery_timeout_seconds),
        )));
    }

    let state = driver.run(|_| pipeline.run(notebook, cancel), cancel)?;
    if let Some(report) = &state.last_report {
        let path = cfg.output.write_report.then(|| pipeline.report_path(notebook));
        print_report(report, cfg.output.json, path.as_deref())?;
    }
    for r in &state.recoveries {
        info!(iteration = r.iteration + 1, exit_code = ?r.exit_code, error = ?r.error, "recovery");
    }
    Ok(match state.stopped_reason {
        Some(StoppedReason::Success) => EXIT_OK,
        Some(StoppedReason::External) => EXIT_CANCELLED,
        Some(StoppedReason::MaxIters) | None => EXIT_CHECK_FAILED,
    })
}

fn watch(cfg: &Config, notebook: &Path, no_validate: bool, cancel: &CancelToken) -> Result<i32> {
    let mut cfg = cfg.clone();
    if no_validate {
        cfg.watch.validate_on_change = false;
    }
    let root = project_root(notebook);
    let marimo = MarimoCommand::from_config(&cfg);
    let log_file = (!cfg.watch.log_file.trim().is_empty())
        .then(|| PathBuf::from(cfg.watch.log_file.trim()));
    let launcher =
        MarimoPreviewLauncher::new(marimo, root.join(&cfg.paths.logs_dir)).with_log_file(log_file);
    let controller = WatchController::new(Arc::new(launcher), notebook, &cfg.watch);

    let pipeline = pipeline(&cfg, notebook);
    let summary = controller.run(|c| pipeline.run(notebook, c), cancel)?;
    if summary.restarts == 0 && summary.changes > 0 {
        warn!("preview could not be restarted after changes");
    }
    Ok(EXIT_OK)
}
