use crate::{
    engine::{Budget, ExportOut, NotebookEngine},
    error::GuardError,
    probe::{PhaseContext, Probe, ProbeResult, Status},
    registry::{ChartDescriptor, ChartLibrary},
};
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Offline export of every known chart; never a live render.
pub struct VisualValidator {
    engine: Arc<dyn NotebookEngine>,
}

impl VisualValidator {
    pub fn new(engine: Arc<dyn NotebookEngine>) -> Self {
        Self { engine }
    }

    /// Export every supported descriptor in one engine call and fold the
    /// findings into one result.
    pub fn validate(
        &self,
        ctx: &PhaseContext,
        descriptors: &[ChartDescriptor],
    ) -> Result<ProbeResult> {
        if ctx.cancel.is_cancelled() {
            return Err(GuardError::Cancelled.into());
        }
        let mut status = Status::Pass;
        let mut messages = Vec::new();
        let (mut exported, mut failed, mut unavailable) = (0u32, 0u32, 0u32);

        let (supported, other): (Vec<ChartDescriptor>, Vec<ChartDescriptor>) = descriptors
            .iter()
            .cloned()
            .partition(|c| c.library != ChartLibrary::Other);
        for chart in &other {
            status = status.worst(Status::Warn);
            messages.push(format!("{}: unsupported library, skipped", chart.name));
        }
        let unsupported = other.len() as u32;

        let verdicts = if supported.is_empty() {
            Ok(Vec::new())
        } else {
            self.engine
                .export_charts(&ctx.notebook, &supported, &Budget::from_ctx(ctx))
        };
        let mut verdicts = match verdicts {
            Ok(v) => v,
            Err(e) => {
                if ctx.cancel.is_cancelled() {
                    return Err(e);
                }
                let e = format!("{e:#}");
                supported
                    .iter()
                    .map(|_| ExportOut {
                        ok: false,
                        error: Some(e.clone()),
                        ..ExportOut::default()
                    })
                    .collect()
            }
        };
        verdicts.resize_with(supported.len(), || ExportOut {
            error: Some("exporter returned no verdict".to_string()),
            ..ExportOut::default()
        });

        for (chart, out) in supported.iter().zip(verdicts) {
            for w in &out.warnings {
                status = status.worst(Status::Warn);
                messages.push(format!("{}: {w}", chart.name));
            }
            if out.unavailable {
                unavailable += 1;
                status = status.worst(Status::Warn);
                messages.push(format!(
                    "{}: {} exporter unavailable: {}",
                    chart.name,
                    chart.library,
                    out.error.as_deref().unwrap_or("not installed")
                ));
            } else if out.ok {
                exported += 1;
                debug!(name = %chart.name, library = %chart.library, "chart exported");
            } else {
                failed += 1;
                status = status.worst(ctx.config.finding());
                messages.push(format!(
                    "{}: {} export failed: {}",
                    chart.name,
                    chart.library,
                    out.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }

        let mut result = ProbeResult::new(status);
        result.messages = messages;
        Ok(result
            .with_metric("charts", descriptors.len() as f64)
            .with_metric("exported", f64::from(exported))
            .with_metric("failed", f64::from(failed))
            .with_metric("unsupported", f64::from(unsupported))
            .with_metric("unavailable", f64::from(unavailable)))
    }
}

impl Probe for VisualValidator {
    fn run(&self, ctx: &PhaseContext) -> Result<ProbeResult> {
        let (descriptors, source) = if ctx.registry.is_empty() {
            (ctx.registry.heuristic(), "heuristic")
        } else {
            (ctx.registry.list(), "registry")
        };
        info!(charts = descriptors.len(), source, "validating charts");

        let result = self.validate(ctx, &descriptors)?;
        let charts: Vec<_> = descriptors
            .iter()
            .map(|d| json!({"name": d.name, "library": d.library, "source": d.source()}))
            .collect();
        Ok(result.with_details(json!({
            "source": source,
            "confidence": if source == "registry" { "high" } else { "low" },
            "charts": charts,
        })))
    }
}
