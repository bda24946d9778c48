use crate::util::notebook_key;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Document a notebook writes about its own internal correctness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfTest {
    pub ok: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

pub fn artifact_path(logs_dir: &Path, notebook: &Path) -> PathBuf {
    logs_dir.join(format!("marimo_selftest_{}.json", notebook_key(notebook)))
}

/// `Ok(None)` when no artifact exists; an unreadable or malformed artifact is an error.
pub fn read(path: &Path) -> Result<Option<SelfTest>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading selftest artifact: {}", path.display()))?;
    let st: SelfTest = serde_json::from_str(&raw)
        .with_context(|| format!("parsing selftest artifact: {}", path.display()))?;
    Ok(Some(st))
}

pub fn clear(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale selftest artifact: {}", path.display()))?;
    }
    Ok(())
}
