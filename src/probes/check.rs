use crate::{
    engine::{Budget, NotebookEngine},
    probe::{PhaseContext, Probe, ProbeResult, Status},
    util::tail,
};
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;

const OUTPUT_EXCERPT_CHARS: usize = 4000;

/// Static lint of the notebook source.
pub struct StaticCheckProbe {
    engine: Arc<dyn NotebookEngine>,
}

impl StaticCheckProbe {
    pub fn new(engine: Arc<dyn NotebookEngine>) -> Self {
        Self { engine }
    }
}

impl Probe for StaticCheckProbe {
    fn run(&self, ctx: &PhaseContext) -> Result<ProbeResult> {
        let out = self
            .engine
            .static_check(&ctx.notebook, &Budget::from_ctx(ctx))
            .with_context(|| "static check")?;

        let warnings = out
            .stdout
            .lines()
            .chain(out.stderr.lines())
            .filter(|l| l.contains("warning["))
            .count();

        let mut result = if out.rc != 0 {
            let mut r = ProbeResult::fail(format!("static check failed (rc={})", out.rc));
            if let Some(first) = out
                .stderr
                .lines()
                .chain(out.stdout.lines())
                .find(|l| !l.trim().is_empty())
            {
                r = r.with_message(first.trim().to_string());
            }
            r
        } else if warnings > 0 {
            ProbeResult::new(Status::Warn)
                .with_message(format!("{warnings} warning(s) reported by static check"))
        } else {
            ProbeResult::pass()
        };

        result = result
            .with_metric("rc", f64::from(out.rc))
            .with_metric("warnings", warnings as f64)
            .with_details(json!({
                "rc": out.rc,
                "stdout": tail(&out.stdout, OUTPUT_EXCERPT_CHARS),
                "stderr": tail(&out.stderr, OUTPUT_EXCERPT_CHARS),
            }));
        Ok(result)
    }
}
