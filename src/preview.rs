//! Foreground preview instances of a notebook.
//!
//! A preview owns its port for its whole lifetime and is torn down on drop,
//! so no exit path can leave an orphaned server behind.

use crate::{
    cancel::CancelToken,
    engine::python::MarimoCommand,
    util::{ensure_dir, notebook_key, port_is_free, tail},
};
use anyhow::{Context, Result, anyhow, bail};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const TERM_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewMode {
    /// Read-only app server (`marimo run`).
    Run,
    /// Editor with the session-query endpoint enabled (`marimo edit --mcp`).
    Edit,
}

pub trait PreviewHandle: Send {
    fn port(&self) -> u16;
    /// Exit description once the process has exited, `None` while alive.
    fn exit_status(&mut self) -> Option<String>;
    fn is_ready(&mut self) -> bool;
    /// Stop the process. Safe to call more than once.
    fn shutdown(&mut self) -> Result<()>;
    fn log_path(&self) -> Option<PathBuf>;
    fn logs(&self) -> String;
}

pub trait PreviewLauncher: Send + Sync {
    fn launch(&self, notebook: &Path, port: u16, mode: PreviewMode)
    -> Result<Box<dyn PreviewHandle>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Exited(String),
    TimedOut,
    Cancelled,
}

/// Poll until the preview accepts connections, exits, or the bounds run out.
pub fn wait_ready(
    handle: &mut dyn PreviewHandle,
    timeout: Duration,
    cancel: &CancelToken,
) -> Readiness {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = handle.exit_status() {
            return Readiness::Exited(status);
        }
        if handle.is_ready() {
            return Readiness::Ready;
        }
        if Instant::now() >= deadline {
            return Readiness::TimedOut;
        }
        if !cancel.sleep(Duration::from_millis(100)) {
            return Readiness::Cancelled;
        }
    }
}

pub struct MarimoPreviewLauncher {
    marimo: MarimoCommand,
    logs_dir: PathBuf,
    /// Overrides the per-port log file name when set.
    log_file: Option<PathBuf>,
}

impl MarimoPreviewLauncher {
    pub fn new(marimo: MarimoCommand, logs_dir: PathBuf) -> Self {
        Self {
            marimo,
            logs_dir,
            log_file: None,
        }
    }

    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }
}

impl PreviewLauncher for MarimoPreviewLauncher {
    fn launch(
        &self,
        notebook: &Path,
        port: u16,
        mode: PreviewMode,
    ) -> Result<Box<dyn PreviewHandle>> {
        if !port_is_free(port) {
            bail!("port {port} is already in use");
        }
        ensure_dir(&self.logs_dir)?;
        let log_path = self.log_file.clone().unwrap_or_else(|| {
            self.logs_dir
                .join(format!("preview_{}_{port}.log", notebook_key(notebook)))
        });
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open preview log: {}", log_path.display()))?;
        let log_start = log.metadata().map(|m| m.len()).unwrap_or(0);
        let log_err = log.try_clone()?;

        let mut args: Vec<OsString> = match mode {
            PreviewMode::Run => vec!["run".into()],
            PreviewMode::Edit => vec!["edit".into()],
        };
        args.push(notebook.as_os_str().to_owned());
        args.extend(["--no-token", "--headless", "--port"].map(OsString::from));
        args.push(port.to_string().into());
        if mode == PreviewMode::Edit {
            args.push("--mcp".into());
        }

        let child = self
            .marimo
            .command(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .with_context(|| format!("spawning preview for {}", notebook.display()))?;
        info!(pid = child.id(), port, ?mode, "preview started");

        Ok(Box::new(MarimoPreview {
            child: Some(child),
            port,
            log_path,
            log_start,
        }))
    }
}

pub struct MarimoPreview {
    child: Option<Child>,
    port: u16,
    log_path: PathBuf,
    log_start: u64,
}

impl PreviewHandle for MarimoPreview {
    fn port(&self) -> u16 {
        self.port
    }

    fn exit_status(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({e})")),
        }
    }

    fn is_ready(&mut self) -> bool {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        terminate(&mut child)?;
        debug!(port = self.port, "preview stopped");
        Ok(())
    }

    fn log_path(&self) -> Option<PathBuf> {
        Some(self.log_path.clone())
    }

    fn logs(&self) -> String {
        let raw = std::fs::read(&self.log_path).unwrap_or_default();
        let start = usize::try_from(self.log_start)
            .unwrap_or(0)
            .min(raw.len());
        String::from_utf8_lossy(&raw[start..]).into_owned()
    }
}

impl Drop for MarimoPreview {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(port = self.port, "preview teardown failed: {e:#}");
        }
    }
}

/// SIGTERM, then SIGKILL after a grace period.
fn terminate(child: &mut Child) -> Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    send_term(child);
    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    warn!(pid = child.id(), "preview ignored SIGTERM; killing");
    child.kill().with_context(|| "kill preview")?;
    child.wait().with_context(|| "wait preview")?;
    Ok(())
}

#[cfg(unix)]
fn send_term(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_term(_child: &Child) {}

/// Launch a detached editor session the user keeps after the guard exits.
pub fn spawn_editor(marimo: &MarimoCommand, notebook: &Path, port: u16) -> Result<(String, u32)> {
    if !port_is_free(port) {
        return Err(anyhow!("port {port} is already in use"));
    }
    let mut args: Vec<OsString> = vec!["edit".into(), notebook.as_os_str().to_owned()];
    args.extend(["--no-token", "--port"].map(OsString::from));
    args.push(port.to_string().into());
    let child = marimo
        .command(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| "spawning marimo edit")?;
    Ok((format!("http://127.0.0.1:{port}/"), child.id()))
}

/// Last part of a preview's log, for reports.
pub fn log_excerpt(handle: &dyn PreviewHandle, max_chars: usize) -> String {
    tail(&handle.logs(), max_chars)
}
