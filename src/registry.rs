//! Run-scoped chart registry.
//!
//! Notebooks register their charts while the programmatic-execution phase
//! runs; the visual-validation phase reads them back. The orchestrator clears
//! the registry at the start of every run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartLibrary {
    Altair,
    Plotly,
    Bokeh,
    Matplotlib,
    Other,
}

impl ChartLibrary {
    /// Normalise a library tag as reported by the notebook runtime.
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim().to_ascii_lowercase();
        let root = tag.split('.').next().unwrap_or_default();
        match root {
            "altair" | "vegalite" | "vega_lite" => ChartLibrary::Altair,
            "plotly" => ChartLibrary::Plotly,
            "bokeh" => ChartLibrary::Bokeh,
            "matplotlib" => ChartLibrary::Matplotlib,
            _ => ChartLibrary::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChartLibrary::Altair => "altair",
            ChartLibrary::Plotly => "plotly",
            ChartLibrary::Bokeh => "bokeh",
            ChartLibrary::Matplotlib => "matplotlib",
            ChartLibrary::Other => "other",
        }
    }
}

impl std::fmt::Display for ChartLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to a chart object living in the notebook runtime.
///
/// The guard never looks inside; it is handed back verbatim to the exporter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChartHandle(pub serde_json::Value);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartDescriptor {
    pub name: String,
    pub library: ChartLibrary,
    pub handle: ChartHandle,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ChartDescriptor {
    pub fn source(&self) -> &str {
        self.metadata
            .get("source")
            .map(String::as_str)
            .unwrap_or("registry")
    }
}

#[derive(Debug, Default)]
struct Entries {
    registered: Vec<ChartDescriptor>,
    heuristic: Vec<ChartDescriptor>,
}

#[derive(Debug, Default)]
pub struct ChartRegistry {
    inner: Mutex<Entries>,
}

impl ChartRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        // A panicking probe must not take the registry down with it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a chart. Re-registering a name replaces the earlier
    /// descriptor in place, keeping its original position.
    pub fn register(
        &self,
        name: &str,
        library: ChartLibrary,
        handle: ChartHandle,
        mut metadata: BTreeMap<String, String>,
    ) {
        metadata
            .entry("source".to_string())
            .or_insert_with(|| "registry".to_string());
        let desc = ChartDescriptor {
            name: name.to_string(),
            library,
            handle,
            metadata,
        };
        let mut entries = self.entries();
        match entries.registered.iter_mut().find(|d| d.name == name) {
            Some(slot) => *slot = desc,
            None => entries.registered.push(desc),
        }
    }

    /// Registered charts in registration order.
    pub fn list(&self) -> Vec<ChartDescriptor> {
        self.entries().registered.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().registered.is_empty()
    }

    pub fn clear(&self) {
        let mut entries = self.entries();
        entries.registered.clear();
        entries.heuristic.clear();
    }

    /// Keep module-scan candidates for when nothing was registered.
    pub fn record_heuristic(&self, candidates: Vec<ChartDescriptor>) {
        self.entries().heuristic = candidates
            .into_iter()
            .map(|mut d| {
                d.metadata
                    .insert("source".to_string(), "heuristic".to_string());
                d
            })
            .collect();
    }

    pub fn heuristic(&self) -> Vec<ChartDescriptor> {
        self.entries().heuristic.clone()
    }
}
