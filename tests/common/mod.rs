#![allow(dead_code)]

use anyhow::{Result, anyhow};
use marimo_guard::{
    engine::{BrowseIn, BrowseOut, Budget, ChartOut, CheckOut, ExecuteOut, ExportOut, NotebookEngine},
    mcp::{ErrorsSummary, SessionClient},
    preview::{PreviewHandle, PreviewLauncher, PreviewMode},
    probe::{PhaseContext, Probe, ProbeResult},
    registry::ChartDescriptor,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct FnProbe<F>(pub F);

impl<F> Probe for FnProbe<F>
where
    F: Fn(&PhaseContext) -> Result<ProbeResult> + Send + Sync,
{
    fn run(&self, ctx: &PhaseContext) -> Result<ProbeResult> {
        (self.0)(ctx)
    }
}

pub fn probe<F>(f: F) -> Arc<dyn Probe>
where
    F: Fn(&PhaseContext) -> Result<ProbeResult> + Send + Sync + 'static,
{
    Arc::new(FnProbe(f))
}

pub fn chart(name: &str, lib: &str) -> ChartOut {
    ChartOut {
        name: name.to_string(),
        lib: lib.to_string(),
        handle: json!({"key": name}),
        meta: BTreeMap::new(),
        export: None,
    }
}

pub struct FakeEngine {
    pub check: CheckOut,
    pub execute: ExecuteOut,
    /// Export result per chart name; missing names export fine.
    pub exports: BTreeMap<String, ExportOut>,
    /// When set, the whole export batch fails with this message.
    pub export_error: Option<String>,
    pub browse: BrowseOut,
    /// Written during `execute`, the way a notebook drops its self-test file.
    pub writes_on_execute: Option<(PathBuf, String)>,
    pub calls: Mutex<Vec<String>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            check: CheckOut {
                rc: 0,
                stdout: String::new(),
                stderr: String::new(),
            },
            execute: ExecuteOut {
                ok: true,
                error: None,
                outputs_len: 1,
                defs_len: 1,
                charts: Vec::new(),
                heuristic: Vec::new(),
            },
            exports: BTreeMap::new(),
            export_error: None,
            browse: BrowseOut::default(),
            writes_on_execute: None,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeEngine {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl NotebookEngine for FakeEngine {
    fn static_check(&self, _notebook: &Path, _budget: &Budget) -> Result<CheckOut> {
        self.record("check".into());
        Ok(self.check.clone())
    }

    fn execute(&self, _notebook: &Path, _budget: &Budget) -> Result<ExecuteOut> {
        self.record("execute".into());
        if let Some((path, body)) = &self.writes_on_execute {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        Ok(self.execute.clone())
    }

    fn export_charts(
        &self,
        _notebook: &Path,
        charts: &[ChartDescriptor],
        _budget: &Budget,
    ) -> Result<Vec<ExportOut>> {
        let names: Vec<&str> = charts.iter().map(|c| c.name.as_str()).collect();
        self.record(format!("export:{}", names.join(",")));
        if let Some(msg) = &self.export_error {
            return Err(anyhow!("{msg}"));
        }
        Ok(charts
            .iter()
            .map(|c| {
                self.exports.get(&c.name).cloned().unwrap_or(ExportOut {
                    ok: true,
                    ..ExportOut::default()
                })
            })
            .collect())
    }

    fn browse(&self, req: &BrowseIn, _budget: &Budget) -> Result<BrowseOut> {
        self.record(format!("browse:{}", req.url));
        Ok(self.browse.clone())
    }
}

#[derive(Clone, Default)]
pub struct LaunchLog {
    pub launches: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
    pub modes: Arc<Mutex<Vec<PreviewMode>>>,
}

impl LaunchLog {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

pub struct FakeLauncher {
    pub ready: bool,
    pub exit_immediately: Option<String>,
    pub logs: String,
    pub fail_launch: Option<String>,
    pub log: LaunchLog,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            ready: true,
            exit_immediately: None,
            logs: String::new(),
            fail_launch: None,
            log: LaunchLog::default(),
        }
    }
}

impl PreviewLauncher for FakeLauncher {
    fn launch(
        &self,
        _notebook: &Path,
        port: u16,
        mode: PreviewMode,
    ) -> Result<Box<dyn PreviewHandle>> {
        if let Some(msg) = &self.fail_launch {
            return Err(anyhow!("{msg}"));
        }
        self.log.launches.fetch_add(1, Ordering::SeqCst);
        self.log.modes.lock().unwrap().push(mode);
        Ok(Box::new(FakeHandle {
            port,
            ready: self.ready,
            exited: self.exit_immediately.clone(),
            logs: self.logs.clone(),
            shutdowns: Arc::clone(&self.log.shutdowns),
            stopped: false,
        }))
    }
}

pub struct FakeHandle {
    port: u16,
    ready: bool,
    exited: Option<String>,
    logs: String,
    shutdowns: Arc<AtomicUsize>,
    stopped: bool,
}

impl PreviewHandle for FakeHandle {
    fn port(&self) -> u16 {
        self.port
    }

    fn exit_status(&mut self) -> Option<String> {
        self.exited.clone()
    }

    fn is_ready(&mut self) -> bool {
        self.ready
    }

    fn shutdown(&mut self) -> Result<()> {
        if !self.stopped {
            self.stopped = true;
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn log_path(&self) -> Option<PathBuf> {
        Some(PathBuf::from(format!("preview_{}.log", self.port)))
    }

    fn logs(&self) -> String {
        self.logs.clone()
    }
}

pub struct FakeSessions {
    pub reachable: bool,
    pub notebooks: Vec<Value>,
    pub summary: ErrorsSummary,
    /// When set, `errors_summary` fails with this text.
    pub summary_error: Option<String>,
}

impl Default for FakeSessions {
    fn default() -> Self {
        Self {
            reachable: false,
            notebooks: Vec::new(),
            summary: ErrorsSummary::default(),
            summary_error: None,
        }
    }
}

impl SessionClient for FakeSessions {
    fn health_check(&self) -> bool {
        self.reachable
    }

    fn active_notebooks(&self) -> Result<Vec<Value>> {
        Ok(self.notebooks.clone())
    }

    fn errors_summary(&self) -> Result<ErrorsSummary> {
        if let Some(msg) = &self.summary_error {
            return Err(anyhow!("{msg}"));
        }
        Ok(self.summary.clone())
    }
}

/// A project directory with a `pyproject.toml` and one notebook in it.
pub fn project(notebook_src: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("pyproject.toml"), "[project]\nname = \"nb\"\n").unwrap();
    let nb = dir.path().join("demo.py");
    std::fs::write(&nb, notebook_src).unwrap();
    (dir, nb)
}
