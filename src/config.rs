use crate::{
    error::GuardError,
    probe::{PhaseConfig, PhaseId},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAMES: [&str; 2] = [".marimo-guard.toml", "marimo-guard.toml"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub check: Check,
    #[serde(default)]
    pub app_run: AppRun,
    #[serde(default)]
    pub visual: Visual,
    #[serde(default)]
    pub smoke: Smoke,
    #[serde(default)]
    pub ui: Ui,
    #[serde(default)]
    pub mcp: Mcp,
    #[serde(default)]
    pub selftest: Selftest,
    #[serde(default)]
    pub guard_loop: GuardLoop,
    #[serde(default)]
    pub watch: Watch,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing TOML: {}", path.display()))
    }

    /// Parse a config document; a top-level `[marimo_guard]` table is unwrapped.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut doc: toml::Table = toml::from_str(raw)?;
        let table = match doc.remove("marimo_guard") {
            Some(toml::Value::Table(inner)) => inner,
            Some(other) => {
                doc.insert("marimo_guard".to_string(), other);
                doc
            }
            None => doc,
        };
        let cfg: Config = toml::from_str(&toml::to_string(&table)?)?;
        Ok(cfg)
    }

    /// Config file next to the project root of `notebook`, if any.
    pub fn discover(project_root: &Path) -> Option<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| project_root.join(name))
            .find(|p| p.exists())
    }

    /// Apply `MARIMO_GUARD_*` overrides. Unparseable values leave the
    /// current setting untouched.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str| lookup(name).and_then(|v| parse_bool(&v));
        let num = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = flag("MARIMO_GUARD_FAIL_ON_WARN") {
            self.check.strict = v;
        }
        if let Some(v) = flag("MARIMO_GUARD_REQUIRE_ARTIFACT") {
            self.selftest.require = v;
        }
        if let Some(v) = flag("MARIMO_GUARD_USE_MCP") {
            self.mcp.enabled = v;
        }
        if let Some(v) = lookup("MARIMO_GUARD_MCP_URL").filter(|v| !v.trim().is_empty()) {
            self.mcp.url = v.trim().to_string();
        }
        if let Some(v) = flag("MARIMO_GUARD_MCP_STRICT") {
            self.mcp.strict = v;
        }
        if let Some(v) = num("MARIMO_GUARD_MCP_WAIT_SECONDS") {
            self.mcp.wait_seconds = v;
        }
        if let Some(v) = flag("MARIMO_GUARD_VISUAL_STRICT") {
            self.visual.strict = v;
        }
        if let Some(v) = flag("MARIMO_GUARD_UI_STRICT") {
            self.ui.strict = v;
            if v {
                self.ui.enabled = true;
            }
        }
        if let Some(v) = num("MARIMO_GUARD_UI_PORT").and_then(|p| u16::try_from(p).ok()) {
            self.ui.port = Some(v);
            self.ui.enabled = true;
        }
        if let Some(v) = num("MARIMO_GUARD_UI_TIMEOUT") {
            self.ui.timeout_seconds = v;
        }
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        let timeouts = [
            ("check", self.check.timeout_seconds),
            ("app_run", self.app_run.timeout_seconds),
            ("visual", self.visual.timeout_seconds),
            ("smoke", self.smoke.timeout_seconds),
            ("ui", self.ui.timeout_seconds),
            ("mcp", self.mcp.timeout_seconds),
        ];
        for (section, secs) in timeouts {
            if secs == 0 {
                return Err(GuardError::ConfigInvalid(format!(
                    "{section}.timeout_seconds must be > 0"
                )));
            }
        }
        if self.guard_loop.max_iters == 0 {
            return Err(GuardError::ConfigInvalid(
                "guard_loop.max_iters must be >= 1".into(),
            ));
        }
        for (name, port) in [
            ("smoke.port", self.smoke.port),
            ("ui.port", self.ui.port),
            ("watch.port", Some(self.watch.port)),
        ] {
            if port == Some(0) {
                return Err(GuardError::ConfigInvalid(format!("{name} must be non-zero")));
            }
        }
        if self.mcp.enabled && self.mcp.url.trim().is_empty() {
            return Err(GuardError::ConfigInvalid(
                "mcp.url is required when mcp.enabled = true".into(),
            ));
        }
        if self.ui.dom_samples == 0 {
            return Err(GuardError::ConfigInvalid("ui.dom_samples must be >= 1".into()));
        }
        Ok(())
    }

    pub fn phase_config(&self, phase: PhaseId) -> PhaseConfig {
        let (enabled, strict, secs) = match phase {
            PhaseId::Check => (
                self.check.enabled,
                self.check.strict,
                self.check.timeout_seconds,
            ),
            PhaseId::AppRun => (
                self.app_run.enabled,
                self.app_run.strict,
                self.app_run.timeout_seconds,
            ),
            PhaseId::VisualValidation => (
                self.visual.enabled,
                self.visual.strict,
                self.visual.timeout_seconds,
            ),
            PhaseId::Run => (
                self.smoke.enabled,
                self.smoke.strict,
                self.smoke.timeout_seconds,
            ),
            PhaseId::Ui => (self.ui.enabled, self.ui.strict, self.ui.timeout_seconds),
            PhaseId::Mcp => (self.mcp.enabled, self.mcp.strict, self.mcp.timeout_seconds),
        };
        PhaseConfig::new(enabled, strict, Duration::from_secs(secs))
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    /// Relative to the project root unless absolute.
    pub logs_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            logs_dir: "logs".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Engine {
    pub python_exe: String,
    pub scripts_dir: String,
    pub marimo_module: String,
}
impl Default for Engine {
    fn default() -> Self {
        Self {
            python_exe: "auto".into(),
            scripts_dir: "scripts".into(),
            marimo_module: "marimo".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Check {
    pub enabled: bool,
    /// `warning[...]` lines from the static checker fail the phase.
    pub strict: bool,
    pub timeout_seconds: u64,
}
impl Default for Check {
    fn default() -> Self {
        Self {
            enabled: true,
            strict: false,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppRun {
    pub enabled: bool,
    pub strict: bool,
    pub timeout_seconds: u64,
}
impl Default for AppRun {
    fn default() -> Self {
        Self {
            enabled: true,
            strict: false,
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Visual {
    pub enabled: bool,
    pub strict: bool,
    pub timeout_seconds: u64,
}
impl Default for Visual {
    fn default() -> Self {
        Self {
            enabled: true,
            strict: false,
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Smoke {
    pub enabled: bool,
    pub strict: bool,
    pub timeout_seconds: u64,
    /// How long the headless instance is left running before teardown.
    pub seconds: u64,
    pub port: Option<u16>,
}
impl Default for Smoke {
    fn default() -> Self {
        Self {
            enabled: true,
            strict: false,
            timeout_seconds: 30,
            seconds: 6,
            port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ui {
    pub enabled: bool,
    pub strict: bool,
    pub timeout_seconds: u64,
    pub port: Option<u16>,
    pub error_allowlist: Vec<String>,
    pub dom_samples: u32,
    pub sample_interval_ms: u64,
    pub selectors: UiSelectors,
}
impl Default for Ui {
    fn default() -> Self {
        Self {
            enabled: false,
            strict: false,
            timeout_seconds: 20,
            port: None,
            error_allowlist: Vec::new(),
            dom_samples: 3,
            sample_interval_ms: 400,
            selectors: Default::default(),
        }
    }
}

/// DOM selectors proving a chart of each library was mounted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiSelectors {
    pub altair: Vec<String>,
    pub plotly: Vec<String>,
    pub bokeh: Vec<String>,
    pub matplotlib: Vec<String>,
}
impl UiSelectors {
    /// Library tag -> selectors, as handed to the browser helper.
    pub fn by_library(&self) -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([
            ("altair".to_string(), self.altair.clone()),
            ("plotly".to_string(), self.plotly.clone()),
            ("bokeh".to_string(), self.bokeh.clone()),
            ("matplotlib".to_string(), self.matplotlib.clone()),
        ])
    }
}

impl Default for UiSelectors {
    fn default() -> Self {
        Self {
            altair: vec!["[role=\"graphics-document\"]".into()],
            plotly: vec!["div.js-plotly-plot".into()],
            bokeh: vec![".bk-root".into()],
            matplotlib: vec!["canvas".into(), "img".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Mcp {
    pub enabled: bool,
    pub strict: bool,
    pub timeout_seconds: u64,
    pub url: String,
    /// Poll for endpoint availability up to this many seconds.
    pub wait_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub max_retries: u32,
}
impl Default for Mcp {
    fn default() -> Self {
        Self {
            enabled: false,
            strict: false,
            timeout_seconds: 15,
            url: "http://localhost:2718/mcp/server".into(),
            wait_seconds: 0,
            connect_timeout_seconds: 5,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Selftest {
    pub require: bool,
    /// Remove a previous run's artifact before executing the notebook.
    pub clear_stale: bool,
}
impl Default for Selftest {
    fn default() -> Self {
        Self {
            require: true,
            clear_stale: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardLoop {
    pub max_iters: u32,
    pub sleep_seconds: u64,
    pub recovery_cmd: String,
    pub recovery_timeout_seconds: u64,
}
impl Default for GuardLoop {
    fn default() -> Self {
        Self {
            max_iters: 3,
            sleep_seconds: 3,
            recovery_cmd: "".into(),
            recovery_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Watch {
    pub port: u16,
    pub poll_ms: u64,
    pub debounce_ms: u64,
    pub log_file: String,
    pub watch_imports: bool,
    pub validate_on_change: bool,
}
impl Default for Watch {
    fn default() -> Self {
        Self {
            port: 2731,
            poll_ms: 500,
            debounce_ms: 250,
            log_file: "".into(),
            watch_imports: true,
            validate_on_change: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Output {
    pub json: bool,
    pub write_report: bool,
    pub write_iteration_reports: bool,
}
impl Default for Output {
    fn default() -> Self {
        Self {
            json: false,
            write_report: true,
            write_iteration_reports: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
