//! Client side of the notebook server's session-query (MCP) endpoint.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub retry_statuses: Vec<u16>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_retries: 3,
            backoff_initial: Duration::from_millis(350),
            backoff_max: Duration::from_secs(5),
            retry_statuses: vec![408, 409, 425, 429, 500, 502, 503, 504],
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Blocking HTTP with bounded retries and exponential backoff.
pub struct HttpClient {
    agent: ureq::Agent,
    cfg: HttpConfig,
}

impl HttpClient {
    pub fn new(cfg: HttpConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(cfg.timeout).build();
        Self { agent, cfg }
    }

    /// `ok_statuses` are accepted as-is; any other non-2xx status is an error.
    pub fn request(
        &self,
        method: &str,
        url: &str,
        body: Option<&Value>,
        ok_statuses: &[u16],
    ) -> Result<HttpResponse> {
        let mut attempt = 0u32;
        let mut backoff = self.cfg.backoff_initial;
        loop {
            let req = self.agent.request(method, url);
            let res = match body {
                Some(b) => req.send_json(b.clone()),
                None => req.call(),
            };
            let (status, resp) = match res {
                Ok(resp) => (resp.status(), resp),
                Err(ureq::Error::Status(code, resp)) => (code, resp),
                Err(ureq::Error::Transport(t)) => {
                    warn!(method, url, attempt, "http transport error: {t}");
                    if attempt >= self.cfg.max_retries {
                        return Err(anyhow!("{method} {url}: {t}"));
                    }
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(self.cfg.backoff_max);
                    attempt += 1;
                    continue;
                }
            };
            debug!(method, url, status, attempt, "http request");

            if self.cfg.retry_statuses.contains(&status) && attempt < self.cfg.max_retries {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(self.cfg.backoff_max);
                attempt += 1;
                continue;
            }

            if (200..300).contains(&status) || ok_statuses.contains(&status) {
                let body = resp.into_string().unwrap_or_default();
                return Ok(HttpResponse { status, body });
            }
            return Err(anyhow!("{method} {url}: HTTP {status}"));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorsSummary {
    #[serde(default)]
    pub notebooks: BTreeMap<String, Value>,
    #[serde(default)]
    pub total_errors: u64,
}

impl ErrorsSummary {
    /// Errors reported for `notebook`, looked up by full path then by file name.
    pub fn errors_for(&self, notebook: &Path) -> Vec<String> {
        let full = notebook.display().to_string();
        let name = notebook
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entry = self
            .notebooks
            .get(&full)
            .or_else(|| self.notebooks.get(&name));
        match entry {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(value_text).collect(),
            Some(other) => vec![value_text(other)],
        }
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Session-query endpoint as seen by the guard.
pub trait SessionClient: Send + Sync {
    fn health_check(&self) -> bool;
    fn active_notebooks(&self) -> Result<Vec<Value>>;
    fn errors_summary(&self) -> Result<ErrorsSummary>;
}

pub struct McpClient {
    base_url: String,
    http: HttpClient,
}

impl McpClient {
    pub fn new(base_url: &str, http: HttpClient) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    fn prompt(&self, name: &str, ok: &[u16]) -> Result<HttpResponse> {
        self.http.request(
            "POST",
            &format!("{}/prompts/{name}", self.base_url),
            Some(&json!({})),
            ok,
        )
    }
}

impl SessionClient for McpClient {
    fn health_check(&self) -> bool {
        let health = format!("{}/health", self.base_url.replace("/mcp/server", ""));
        if self.http.request("GET", &health, None, &[404, 405]).is_ok() {
            return true;
        }
        self.prompt("active_notebooks", &[400, 404]).is_ok()
    }

    fn active_notebooks(&self) -> Result<Vec<Value>> {
        let resp = self.prompt("active_notebooks", &[])?;
        match parse_mcp_response(resp.json()?) {
            Value::Array(items) => Ok(items),
            other => {
                warn!("unexpected active_notebooks payload: {other}");
                Ok(Vec::new())
            }
        }
    }

    fn errors_summary(&self) -> Result<ErrorsSummary> {
        let resp = self.prompt("errors_summary", &[])?;
        let parsed = parse_mcp_response(resp.json()?);
        Ok(serde_json::from_value(parsed).unwrap_or_default())
    }
}

/// Unwrap the `{"content": [{"text": "<json>"}]}` envelope when present.
pub fn parse_mcp_response(data: Value) -> Value {
    let text = data
        .get("content")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .map(|first| match first {
            Value::Object(_) => first
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            other => value_text(other),
        });
    if let Some(text) = text {
        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
            return parsed;
        }
    }
    data
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotebookSession {
    pub session_id: String,
    pub file_path: PathBuf,
    pub status: String,
    pub metadata: Value,
}

/// Active-session lookups on top of a [`SessionClient`].
pub struct SessionService<'a> {
    client: &'a dyn SessionClient,
}

impl<'a> SessionService<'a> {
    pub fn new(client: &'a dyn SessionClient) -> Self {
        Self { client }
    }

    pub fn active_sessions(&self) -> Vec<NotebookSession> {
        let notebooks = match self.client.active_notebooks() {
            Ok(n) => n,
            Err(e) => {
                debug!("failed to list active sessions: {e:#}");
                return Vec::new();
            }
        };
        notebooks
            .into_iter()
            .filter_map(|nb| {
                let file_path = nb
                    .get("file_path")
                    .or_else(|| nb.get("path"))
                    .and_then(Value::as_str)
                    .filter(|p| !p.is_empty())?
                    .to_string();
                let session_id = nb
                    .get("session_id")
                    .or_else(|| nb.get("id"))
                    .map(value_text)
                    .unwrap_or_else(|| file_path.clone());
                let status = nb
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("active")
                    .to_string();
                Some(NotebookSession {
                    session_id,
                    file_path: PathBuf::from(file_path),
                    status,
                    metadata: nb,
                })
            })
            .collect()
    }

    pub fn session_for_notebook(&self, notebook: &Path) -> Option<NotebookSession> {
        let target = normalize(notebook);
        self.active_sessions().into_iter().find(|s| {
            let candidate = normalize(&s.file_path);
            candidate == target || candidate.file_name() == target.file_name()
        })
    }

    pub fn is_notebook_active(&self, notebook: &Path) -> bool {
        self.session_for_notebook(notebook).is_some()
    }

    pub fn warn_if_active(&self, notebook: &Path) -> Option<String> {
        self.session_for_notebook(notebook).map(|s| {
            format!(
                "notebook is currently open in marimo (session: {}); concurrent edits may conflict",
                s.session_id
            )
        })
    }
}

fn normalize(p: &Path) -> PathBuf {
    p.canonicalize().unwrap_or_else(|_| p.to_path_buf())
}
