use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOut {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteIn {
    pub notebook: String,
    /// Where the notebook's own helpers drop artifacts (self-test).
    pub logs_dir: String,
    /// Export every reported chart inside the same interpreter run.
    pub export: bool,
}

/// A chart as reported by the execution helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartOut {
    pub name: String,
    #[serde(default)]
    pub lib: String,
    #[serde(default)]
    pub handle: serde_json::Value,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Export verdict from the execution run, when exports were requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportOut>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteOut {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub outputs_len: u64,
    #[serde(default)]
    pub defs_len: u64,
    /// Charts the notebook registered explicitly.
    #[serde(default)]
    pub charts: Vec<ChartOut>,
    /// Chart-like module globals found by scanning.
    #[serde(default)]
    pub heuristic: Vec<ChartOut>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportChart {
    pub name: String,
    pub library: String,
    pub handle: serde_json::Value,
}

/// One batched export request: the notebook runs once for all charts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportIn {
    pub notebook: String,
    pub logs_dir: String,
    pub charts: Vec<ExportChart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportBatchOut {
    /// Chart name -> export verdict.
    #[serde(default)]
    pub results: BTreeMap<String, ExportOut>,
    /// Set when the notebook itself could not be run.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportOut {
    pub ok: bool,
    /// The exporter for this library is not installed.
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Non-fatal export notes (optional converters failing, etc).
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseIn {
    pub url: String,
    pub timeout_ms: u64,
    pub dom_samples: u32,
    pub sample_interval_ms: u64,
    /// Library tag -> selectors to count.
    pub selectors: BTreeMap<String, Vec<String>>,
    pub screenshot_path: String,
    pub html_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowseOut {
    /// The browser automation stack is not installed.
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub console_errors: Vec<String>,
    #[serde(default)]
    pub console_warnings: Vec<String>,
    #[serde(default)]
    pub request_failures: Vec<String>,
    /// Library tag -> selector -> maximum match count over all samples.
    #[serde(default)]
    pub dom: BTreeMap<String, BTreeMap<String, u32>>,
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
}
