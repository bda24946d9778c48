use crate::{
    engine::{Budget, ChartOut, NotebookEngine},
    probe::{PhaseContext, Probe, ProbeResult},
    registry::{ChartDescriptor, ChartHandle, ChartLibrary},
};
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Imports the notebook and runs its app once, populating the chart registry.
pub struct ExecutionProbe {
    engine: Arc<dyn NotebookEngine>,
}

impl ExecutionProbe {
    pub fn new(engine: Arc<dyn NotebookEngine>) -> Self {
        Self { engine }
    }
}

fn descriptor(chart: ChartOut) -> ChartDescriptor {
    let mut metadata = chart.meta;
    if !chart.lib.is_empty() {
        metadata.insert("lib".to_string(), chart.lib.clone());
    }
    ChartDescriptor {
        library: ChartLibrary::from_tag(&chart.lib),
        name: chart.name,
        handle: ChartHandle(chart.handle),
        metadata,
    }
}

impl Probe for ExecutionProbe {
    fn run(&self, ctx: &PhaseContext) -> Result<ProbeResult> {
        let out = self
            .engine
            .execute(&ctx.notebook, &Budget::from_ctx(ctx))
            .with_context(|| "notebook execution")?;

        for chart in out.charts {
            let d = descriptor(chart);
            debug!(name = %d.name, library = %d.library, "chart registered");
            ctx.registry.register(&d.name, d.library, d.handle, d.metadata);
        }
        let heuristic: Vec<ChartDescriptor> = out.heuristic.into_iter().map(descriptor).collect();
        let heuristic_len = heuristic.len();
        ctx.registry.record_heuristic(heuristic);

        let registered = ctx.registry.list().len();
        let result = if out.ok {
            ProbeResult::pass()
        } else {
            ProbeResult::fail(
                out.error
                    .unwrap_or_else(|| "notebook execution failed".to_string()),
            )
        };
        Ok(result
            .with_metric("outputs_len", out.outputs_len as f64)
            .with_metric("defs_len", out.defs_len as f64)
            .with_metric("charts_registered", registered as f64)
            .with_metric("heuristic_candidates", heuristic_len as f64)
            .with_details(json!({
                "ok": out.ok,
                "outputs_len": out.outputs_len,
                "defs_len": out.defs_len,
            })))
    }
}
