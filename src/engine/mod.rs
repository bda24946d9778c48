pub mod python;
pub mod types;

use crate::{cancel::CancelToken, probe::PhaseContext, registry::ChartDescriptor};
use anyhow::Result;
use std::path::Path;
use std::time::Duration;

pub use types::{BrowseIn, BrowseOut, ChartOut, CheckOut, ExecuteOut, ExportOut};

/// Time and cancellation bounds for one engine call.
#[derive(Debug, Clone)]
pub struct Budget {
    pub timeout: Duration,
    pub cancel: CancelToken,
}

impl Budget {
    pub fn from_ctx(ctx: &PhaseContext) -> Self {
        Self {
            timeout: ctx.remaining(),
            cancel: ctx.cancel.clone(),
        }
    }
}

/// Adapter over the notebook runtime and its tooling.
pub trait NotebookEngine: Send + Sync {
    fn static_check(&self, notebook: &Path, budget: &Budget) -> Result<CheckOut>;
    fn execute(&self, notebook: &Path, budget: &Budget) -> Result<ExecuteOut>;
    /// Export `charts` offline, one verdict per chart in the same order.
    fn export_charts(
        &self,
        notebook: &Path,
        charts: &[ChartDescriptor],
        budget: &Budget,
    ) -> Result<Vec<ExportOut>>;
    fn browse(&self, req: &BrowseIn, budget: &Budget) -> Result<BrowseOut>;
}
