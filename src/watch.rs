//! Continuous re-validation on file changes.
//!
//! A monitor thread polls the notebook (and its directly imported local
//! modules) and reports content changes over a channel. The controller owns
//! one preview, restarts it on every change, and runs at most one
//! validation at a time; changes that arrive during a run collapse into a
//! single follow-up run.

use crate::{
    cancel::CancelToken,
    config::Watch,
    error::GuardError,
    preview::{PreviewHandle, PreviewLauncher, PreviewMode},
    report::Report,
    util::sha256_hex,
};
use anyhow::Result;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
struct FileIdentity {
    len: u64,
    modified_nanos: u128,
    sha256: String,
}

impl FileIdentity {
    fn stat(path: &Path) -> Option<(u64, u128)> {
        let meta = std::fs::metadata(path).ok()?;
        let modified_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Some((meta.len(), modified_nanos))
    }

    fn for_path(path: &Path) -> Option<Self> {
        let (len, modified_nanos) = Self::stat(path)?;
        let bytes = std::fs::read(path).ok()?;
        Some(Self {
            len,
            modified_nanos,
            sha256: sha256_hex(&bytes),
        })
    }
}

/// Local modules the notebook imports directly, resolved next to it.
///
/// Covers `import a, b as c`, `from a import x`, `from .a import x` and
/// `from . import a, b`; leading dots climb one directory per extra dot.
pub fn local_imports(notebook: &Path) -> Vec<PathBuf> {
    let Ok(source) = std::fs::read_to_string(notebook) else {
        return Vec::new();
    };
    let Ok(re) = Regex::new(
        r"(?m)^[ \t]*(?:import[ \t]+([^#\n]+)|from[ \t]+(\.*)([A-Za-z_][\w.]*)?[ \t]+import[ \t]+\(?([^#\n)]+))",
    ) else {
        return Vec::new();
    };
    let dir = notebook.parent().unwrap_or_else(|| Path::new("."));
    let mut out: Vec<PathBuf> = Vec::new();
    let mut push = |base: &Path, module: &str| {
        let Some(head) = module.split('.').next().filter(|h| !h.is_empty()) else {
            return;
        };
        let candidate = base.join(format!("{head}.py"));
        if candidate.is_file() && candidate != notebook && !out.contains(&candidate) {
            out.push(candidate);
        }
    };

    for caps in re.captures_iter(&source) {
        if let Some(list) = caps.get(1) {
            for module in import_names(list.as_str()) {
                push(dir, module);
            }
            continue;
        }
        let dots = caps.get(2).map_or(0, |m| m.as_str().len());
        let mut base = dir;
        for _ in 1..dots {
            base = base.parent().unwrap_or(base);
        }
        match caps.get(3) {
            Some(module) => push(base, module.as_str()),
            // `from . import a, b` names sibling modules directly.
            None if dots > 0 => {
                if let Some(names) = caps.get(4) {
                    for module in import_names(names.as_str()) {
                        push(base, module);
                    }
                }
            }
            None => {}
        }
    }
    out
}

/// Module names from a comma list, `as` aliases dropped.
fn import_names(list: &str) -> impl Iterator<Item = &str> {
    list.split(',')
        .filter_map(|item| item.split_whitespace().next())
        .filter(|name| name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.'))
}

/// Polling watcher; stopped on drop.
pub struct FileMonitor {
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl FileMonitor {
    pub fn start(
        paths: Vec<PathBuf>,
        poll: Duration,
        tx: mpsc::Sender<PathBuf>,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let stop = cancel.child();
        let thread_stop = stop.clone();
        let mut baseline: BTreeMap<PathBuf, Option<FileIdentity>> = paths
            .into_iter()
            .map(|p| {
                let id = FileIdentity::for_path(&p);
                (p, id)
            })
            .collect();

        let handle = std::thread::Builder::new()
            .name("watch-monitor".to_string())
            .spawn(move || {
                while thread_stop.sleep(poll) {
                    for (path, known) in baseline.iter_mut() {
                        let stat = FileIdentity::stat(path);
                        let unchanged = match (known.as_ref(), stat) {
                            (Some(k), Some((len, mtime))) => {
                                k.len == len && k.modified_nanos == mtime
                            }
                            (None, None) => true,
                            _ => false,
                        };
                        if unchanged {
                            continue;
                        }
                        let current = FileIdentity::for_path(path);
                        let same_content = match (known.as_ref(), current.as_ref()) {
                            (Some(k), Some(c)) => k.sha256 == c.sha256,
                            _ => false,
                        };
                        *known = current;
                        if same_content {
                            debug!(path = %path.display(), "touched without content change");
                            continue;
                        }
                        if tx.send(path.clone()).is_err() {
                            return;
                        }
                    }
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.cancel();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Default)]
pub struct WatchSummary {
    /// Change events received, before coalescing.
    pub changes: u32,
    pub runs: u32,
    pub restarts: u32,
    pub last_report: Option<Report>,
}

pub struct WatchController {
    launcher: Arc<dyn PreviewLauncher>,
    notebook: PathBuf,
    port: u16,
    poll: Duration,
    debounce: Duration,
    watch_imports: bool,
    validate_on_change: bool,
}

impl WatchController {
    pub fn new(launcher: Arc<dyn PreviewLauncher>, notebook: &Path, cfg: &Watch) -> Self {
        Self {
            launcher,
            notebook: notebook.to_path_buf(),
            port: cfg.port,
            poll: Duration::from_millis(cfg.poll_ms),
            debounce: Duration::from_millis(cfg.debounce_ms),
            watch_imports: cfg.watch_imports,
            validate_on_change: cfg.validate_on_change,
        }
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.notebook.clone()];
        if self.watch_imports {
            paths.extend(local_imports(&self.notebook));
        }
        paths
    }

    /// Watch until `cancel` fires.
    pub fn run<F>(&self, validate: F, cancel: &CancelToken) -> Result<WatchSummary>
    where
        F: FnMut(&CancelToken) -> Result<Report>,
    {
        let (tx, rx) = mpsc::channel();
        let paths = self.watched_paths();
        info!(files = paths.len(), port = self.port, "watching");
        let _monitor = FileMonitor::start(paths, self.poll, tx, cancel)?;
        self.drive(&rx, validate, cancel)
    }

    fn launch(&self) -> Result<Box<dyn PreviewHandle>> {
        self.launcher
            .launch(&self.notebook, self.port, PreviewMode::Edit)
            .map_err(|e| GuardError::LaunchFailed(format!("{e:#}")).into())
    }

    /// Event loop over change notifications; the preview is torn down on exit.
    pub fn drive<F>(
        &self,
        rx: &mpsc::Receiver<PathBuf>,
        mut validate: F,
        cancel: &CancelToken,
    ) -> Result<WatchSummary>
    where
        F: FnMut(&CancelToken) -> Result<Report>,
    {
        let mut summary = WatchSummary::default();
        let mut preview = Some(self.launch()?);
        info!(url = %format!("http://127.0.0.1:{}/", self.port), "preview up");

        while !cancel.is_cancelled() {
            let first = match rx.recv_timeout(self.poll) {
                Ok(path) => path,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };
            summary.changes += 1;
            if !cancel.sleep(self.debounce) {
                break;
            }
            let mut changed = vec![first];
            while let Ok(path) = rx.try_recv() {
                summary.changes += 1;
                if !changed.contains(&path) {
                    changed.push(path);
                }
            }
            info!(files = ?changed, "change detected");

            if let Some(mut old) = preview.take() {
                if let Err(e) = old.shutdown() {
                    warn!("preview shutdown failed: {e:#}");
                }
            }
            match self.launch() {
                Ok(h) => {
                    preview = Some(h);
                    summary.restarts += 1;
                }
                Err(e) => warn!("preview restart failed: {e:#}"),
            }

            if !self.validate_on_change {
                continue;
            }
            summary.runs += 1;
            match validate(cancel) {
                Ok(report) => {
                    if report.ok {
                        info!("validation ok");
                    } else {
                        warn!("validation failed:\n{}", report.failure_summary());
                    }
                    summary.last_report = Some(report);
                }
                Err(e) if matches!(e.downcast_ref::<GuardError>(), Some(GuardError::Cancelled)) => {
                    break;
                }
                Err(e) => warn!("validation run errored: {e:#}"),
            }
        }

        if let Some(mut p) = preview.take() {
            if let Err(e) = p.shutdown() {
                warn!("preview shutdown failed: {e:#}");
            }
        }
        info!(changes = summary.changes, runs = summary.runs, "watch stopped");
        Ok(summary)
    }
}
