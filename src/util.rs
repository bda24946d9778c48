use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;

pub fn ensure_dir(p: &Path) -> Result<()> {
    std::fs::create_dir_all(p).with_context(|| format!("create_dir_all {}", p.display()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    format!("{:x}", h.finalize())
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn hash_file(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut h = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(format!("{:x}", h.finalize()))
}

/// Nearest ancestor holding `.git` or `pyproject.toml`; the notebook's own
/// directory when none does.
pub fn project_root(notebook: &Path) -> PathBuf {
    let start = notebook
        .canonicalize()
        .unwrap_or_else(|_| notebook.to_path_buf());
    for dir in start.ancestors() {
        if dir.join(".git").exists() || dir.join("pyproject.toml").exists() {
            return dir.to_path_buf();
        }
    }
    start
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// File stem used to key per-notebook artifacts.
pub fn notebook_key(notebook: &Path) -> String {
    notebook
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("notebook")
        .to_string()
}

pub fn fmt_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

/// Last `max_chars` characters of `s`, on a char boundary.
pub fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}

pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

pub fn pick_free_port(preferred: Option<u16>) -> Result<u16> {
    if let Some(p) = preferred {
        if port_is_free(p) {
            return Ok(p);
        }
    }
    let listener = TcpListener::bind(("127.0.0.1", 0)).with_context(|| "bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}
