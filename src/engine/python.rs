use super::{Budget, NotebookEngine, types::*};
use crate::{
    cancel::CancelToken, config::Config, error::GuardError, registry::ChartDescriptor,
    util::project_root,
};
use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const EXECUTE_SCRIPT: &str = "guard_execute.py";
const EXPORT_SCRIPT: &str = "guard_export.py";
const BROWSE_SCRIPT: &str = "guard_browse.py";

/// `python -m marimo ...` with the resolved interpreter.
#[derive(Debug, Clone)]
pub struct MarimoCommand {
    python_exe: PathBuf,
    module: String,
    /// Prepended to `PYTHONPATH` so notebooks can `import guard_notebook`.
    helpers_dir: Option<PathBuf>,
}

impl MarimoCommand {
    pub fn from_config(cfg: &Config) -> Self {
        let scripts = PathBuf::from(&cfg.engine.scripts_dir);
        Self {
            python_exe: resolve_python_exe(&cfg.engine.python_exe),
            module: cfg.engine.marimo_module.clone(),
            helpers_dir: scripts.is_dir().then(|| scripts.canonicalize().unwrap_or(scripts)),
        }
    }

    pub fn python(&self) -> &Path {
        &self.python_exe
    }

    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.python_exe);
        cmd.arg("-m").arg(&self.module).args(args);
        if let Some(path) = self.python_path() {
            cmd.env("PYTHONPATH", path);
        }
        cmd
    }

    fn python_path(&self) -> Option<OsString> {
        let helpers = self.helpers_dir.as_ref()?;
        let mut paths = vec![helpers.clone()];
        if let Some(existing) = std::env::var_os("PYTHONPATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(paths).ok()
    }
}

/// Export verdicts produced by the last execution, keyed by chart name.
///
/// The execution helper exports every chart it reports while the notebook's
/// objects are still alive, so the visual phase does not run the notebook
/// again for charts it already has a verdict for.
#[derive(Debug, Default)]
pub struct ExportCache {
    inner: Mutex<Option<(PathBuf, BTreeMap<String, ExportOut>)>>,
}

impl ExportCache {
    fn slot(&self) -> MutexGuard<'_, Option<(PathBuf, BTreeMap<String, ExportOut>)>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the cache with the verdicts carried by `out`.
    pub fn store(&self, notebook: &Path, out: &ExecuteOut) {
        let verdicts = out
            .charts
            .iter()
            .chain(&out.heuristic)
            .filter_map(|c| c.export.clone().map(|e| (c.name.clone(), e)))
            .collect();
        *self.slot() = Some((notebook.to_path_buf(), verdicts));
    }

    /// Cached verdicts for `charts`, `None` where the last run had none.
    pub fn lookup(&self, notebook: &Path, charts: &[ChartDescriptor]) -> Vec<Option<ExportOut>> {
        let slot = self.slot();
        match slot.as_ref() {
            Some((nb, verdicts)) if nb == notebook => charts
                .iter()
                .map(|c| verdicts.get(&c.name).cloned())
                .collect(),
            _ => vec![None; charts.len()],
        }
    }
}

pub struct PythonEngine {
    marimo: MarimoCommand,
    scripts_dir: PathBuf,
    logs_dir: PathBuf,
    export_on_execute: bool,
    exports: ExportCache,
}

impl PythonEngine {
    pub fn new(cfg: &Config) -> Self {
        Self {
            marimo: MarimoCommand::from_config(cfg),
            scripts_dir: PathBuf::from(&cfg.engine.scripts_dir),
            logs_dir: PathBuf::from(&cfg.paths.logs_dir),
            export_on_execute: cfg.visual.enabled,
            exports: ExportCache::default(),
        }
    }

    fn logs_dir_for(&self, notebook: &Path) -> String {
        project_root(notebook)
            .join(&self.logs_dir)
            .display()
            .to_string()
    }

    pub fn marimo(&self) -> &MarimoCommand {
        &self.marimo
    }

    fn script(&self, name: &str) -> Result<PathBuf> {
        let path = self.scripts_dir.join(name);
        if !path.exists() {
            return Err(anyhow!("missing helper script: {}", path.display()));
        }
        Ok(path)
    }

    fn run_json<I: serde::Serialize, O: for<'de> serde::Deserialize<'de>>(
        &self,
        script: &Path,
        input: &I,
        budget: &Budget,
    ) -> Result<O> {
        debug!("python run {} timeout={:?}", script.display(), budget.timeout);
        let mut cmd = Command::new(self.marimo.python());
        cmd.arg(script);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning python: {}", script.display()))?;

        {
            let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
            let bytes = serde_json::to_vec(input)?;
            use std::io::Write;
            stdin.write_all(&bytes)?;
            stdin.flush().ok();
        }

        let output = wait_with_timeout(&mut child, budget.timeout, &budget.cancel)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "python script failed: {}\n{}",
                script.display(),
                stderr
            ));
        }

        if !output.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("python stderr {}: {}", script.display(), stderr.trim());
        }

        let out: O = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parsing python JSON output: {}", script.display()))?;
        Ok(out)
    }
}

fn resolve_python_exe(raw: &str) -> PathBuf {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("auto") {
        if let Ok(env_val) = std::env::var("MARIMO_GUARD_PYTHON") {
            let p = expand_tilde(&env_val);
            if p.exists() {
                return p;
            }
        }
        let venv = PathBuf::from(".venv/bin/python");
        if venv.exists() {
            return venv;
        }
        return PathBuf::from("python3");
    }
    expand_tilde(raw)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

impl NotebookEngine for PythonEngine {
    fn static_check(&self, notebook: &Path, budget: &Budget) -> Result<CheckOut> {
        let mut cmd = self.marimo.command([OsStr::new("check"), notebook.as_os_str()]);
        let output = run_captured(&mut cmd, budget).with_context(|| "marimo check")?;
        Ok(CheckOut {
            rc: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn execute(&self, notebook: &Path, budget: &Budget) -> Result<ExecuteOut> {
        let script = self.script(EXECUTE_SCRIPT)?;
        let req = ExecuteIn {
            notebook: notebook.display().to_string(),
            logs_dir: self.logs_dir_for(notebook),
            export: self.export_on_execute,
        };
        let out: ExecuteOut = self.run_json(&script, &req, budget)?;
        self.exports.store(notebook, &out);
        Ok(out)
    }

    fn export_charts(
        &self,
        notebook: &Path,
        charts: &[ChartDescriptor],
        budget: &Budget,
    ) -> Result<Vec<ExportOut>> {
        let mut verdicts = self.exports.lookup(notebook, charts);
        let missing: Vec<ExportChart> = charts
            .iter()
            .zip(&verdicts)
            .filter(|(_, v)| v.is_none())
            .map(|(c, _)| ExportChart {
                name: c.name.clone(),
                library: c.library.as_str().to_string(),
                handle: c.handle.0.clone(),
            })
            .collect();

        if !missing.is_empty() {
            debug!(charts = missing.len(), "exporting charts without a cached verdict");
            let script = self.script(EXPORT_SCRIPT)?;
            let req = ExportIn {
                notebook: notebook.display().to_string(),
                logs_dir: self.logs_dir_for(notebook),
                charts: missing,
            };
            let batch: ExportBatchOut = self.run_json(&script, &req, budget)?;
            if let Some(err) = &batch.error {
                return Err(anyhow!("export run failed: {err}"));
            }
            for (chart, verdict) in charts.iter().zip(verdicts.iter_mut()) {
                if verdict.is_none() {
                    *verdict = batch.results.get(&chart.name).cloned();
                }
            }
        }

        Ok(charts
            .iter()
            .zip(verdicts)
            .map(|(chart, verdict)| {
                let out = verdict.unwrap_or_else(|| ExportOut {
                    ok: false,
                    error: Some("exporter returned no verdict".to_string()),
                    ..ExportOut::default()
                });
                if !out.ok && !out.unavailable {
                    warn!("export returned ok=false for chart {}", chart.name);
                }
                out
            })
            .collect())
    }

    fn browse(&self, req: &BrowseIn, budget: &Budget) -> Result<BrowseOut> {
        let script = self.script(BROWSE_SCRIPT)?;
        self.run_json(&script, req, budget)
    }
}

/// Run `cmd` with piped output, bounded by `budget`.
pub fn run_captured(cmd: &mut Command, budget: &Budget) -> Result<Output> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {:?}", cmd.get_program()))?;
    wait_with_timeout(&mut child, budget.timeout, &budget.cancel)
}

/// Wait for `child`, killing it on timeout or cancellation.
pub fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<Output> {
    // Drain pipes while waiting so a chatty child can't block on a full
    // stdout/stderr buffer.
    let stdout_reader = child.stdout.take();
    let stderr_reader = child.stderr.take();

    let stdout_thread = std::thread::spawn(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout_reader {
            out.read_to_end(&mut buf).with_context(|| "read stdout")?;
        }
        Ok(buf)
    });

    let stderr_thread = std::thread::spawn(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr_reader {
            err.read_to_end(&mut buf).with_context(|| "read stderr")?;
        }
        Ok(buf)
    });

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().with_context(|| "try_wait")? {
            let stdout = stdout_thread
                .join()
                .map_err(|_| anyhow!("stdout reader thread panicked"))??;
            let stderr = stderr_thread
                .join()
                .map_err(|_| anyhow!("stderr reader thread panicked"))??;
            return Ok(Output {
                status,
                stdout,
                stderr,
            });
        }

        let timed_out = start.elapsed() > timeout;
        if timed_out || cancel.is_cancelled() {
            if timed_out {
                warn!("process timed out after {:?}", timeout);
            }
            let _ = child.kill();
            child.wait().with_context(|| "wait after kill")?;
            let _ = stdout_thread.join();
            let _ = stderr_thread.join();
            if timed_out {
                return Err(GuardError::ProbeTimeout {
                    phase: "subprocess".to_string(),
                    timeout,
                }
                .into());
            }
            return Err(GuardError::Cancelled.into());
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}
