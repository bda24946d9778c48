mod common;

use common::{FakeEngine, chart};
use marimo_guard::{
    cancel::CancelToken,
    engine::ExportOut,
    probe::{PhaseConfig, PhaseContext, PhaseId, Probe, Status},
    probes::VisualValidator,
    registry::{ChartDescriptor, ChartHandle, ChartLibrary, ChartRegistry},
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn ctx(strict: bool, registry: Arc<ChartRegistry>) -> PhaseContext {
    PhaseContext {
        phase: PhaseId::VisualValidation,
        notebook: PathBuf::from("demo.py"),
        project_root: PathBuf::from("."),
        config: PhaseConfig::new(true, strict, Duration::from_secs(30)),
        registry,
        cancel: CancelToken::new(),
        deadline: Instant::now() + Duration::from_secs(30),
    }
}

fn desc(name: &str, library: ChartLibrary) -> ChartDescriptor {
    ChartDescriptor {
        name: name.to_string(),
        library,
        handle: ChartHandle(json!({"key": name})),
        metadata: BTreeMap::new(),
    }
}

fn broken_export() -> FakeEngine {
    let mut engine = FakeEngine::default();
    engine.exports.insert(
        "revenue".into(),
        ExportOut {
            ok: false,
            error: Some("invalid encoding".into()),
            ..ExportOut::default()
        },
    );
    engine
}

#[test]
fn export_failure_warns_unless_strict() {
    let charts = [desc("revenue", ChartLibrary::Altair), desc("ok", ChartLibrary::Plotly)];

    let v = VisualValidator::new(Arc::new(broken_export()));
    let lenient = v.validate(&ctx(false, Arc::default()), &charts).unwrap();
    assert_eq!(lenient.status, Status::Warn);
    assert_eq!(
        lenient.messages,
        vec!["revenue: altair export failed: invalid encoding".to_string()]
    );
    assert_eq!(lenient.metrics["exported"], 1.0);

    let strict = v.validate(&ctx(true, Arc::default()), &charts).unwrap();
    assert_eq!(strict.status, Status::Fail);
}

#[test]
fn unsupported_library_is_a_warning_even_when_strict() {
    let v = VisualValidator::new(Arc::new(FakeEngine::default()));
    let r = v
        .validate(&ctx(true, Arc::default()), &[desc("pie", ChartLibrary::Other)])
        .unwrap();
    assert_eq!(r.status, Status::Warn);
    assert_eq!(r.messages, vec!["pie: unsupported library, skipped".to_string()]);
}

#[test]
fn missing_exporter_is_a_warning_even_when_strict() {
    let mut engine = FakeEngine::default();
    engine.exports.insert(
        "fig".into(),
        ExportOut {
            unavailable: true,
            error: Some("No module named 'bokeh'".into()),
            ..ExportOut::default()
        },
    );
    let v = VisualValidator::new(Arc::new(engine));
    let r = v
        .validate(&ctx(true, Arc::default()), &[desc("fig", ChartLibrary::Bokeh)])
        .unwrap();
    assert_eq!(r.status, Status::Warn);
    assert!(r.messages[0].contains("exporter unavailable"));
}

#[test]
fn all_exports_clean_is_pass() {
    let v = VisualValidator::new(Arc::new(FakeEngine::default()));
    let r = v
        .validate(
            &ctx(true, Arc::default()),
            &[desc("a", ChartLibrary::Matplotlib), desc("b", ChartLibrary::Plotly)],
        )
        .unwrap();
    assert_eq!(r.status, Status::Pass);
    assert!(r.messages.is_empty());
}

#[test]
fn empty_registry_falls_back_to_heuristic_scan() {
    let engine = Arc::new(FakeEngine::default());
    let registry = Arc::new(ChartRegistry::new());
    registry.record_heuristic(vec![desc("fig1", ChartLibrary::Matplotlib)]);

    let r = VisualValidator::new(engine.clone())
        .run(&ctx(false, registry))
        .unwrap();
    assert_eq!(r.status, Status::Pass);
    assert_eq!(r.details["source"], "heuristic");
    assert_eq!(r.details["confidence"], "low");
    assert_eq!(r.details["charts"][0]["source"], "heuristic");
    assert_eq!(engine.calls(), vec!["export:fig1".to_string()]);
}

#[test]
fn registered_charts_take_precedence() {
    let engine = Arc::new(FakeEngine::default());
    let registry = Arc::new(ChartRegistry::new());
    let c = chart("sales", "altair");
    registry.register(&c.name, ChartLibrary::Altair, ChartHandle(c.handle), BTreeMap::new());
    registry.record_heuristic(vec![desc("other", ChartLibrary::Plotly)]);

    let r = VisualValidator::new(engine.clone())
        .run(&ctx(false, registry))
        .unwrap();
    assert_eq!(r.details["source"], "registry");
    assert_eq!(engine.calls(), vec!["export:sales".to_string()]);
}

#[test]
fn all_charts_export_in_one_engine_call() {
    let engine = Arc::new(FakeEngine::default());
    let charts = [
        desc("a", ChartLibrary::Altair),
        desc("pie", ChartLibrary::Other),
        desc("b", ChartLibrary::Bokeh),
    ];
    let r = VisualValidator::new(engine.clone())
        .validate(&ctx(false, Arc::default()), &charts)
        .unwrap();
    assert_eq!(engine.calls(), vec!["export:a,b".to_string()]);
    assert_eq!(r.metrics["exported"], 2.0);
    assert_eq!(r.metrics["unsupported"], 1.0);
}

#[test]
fn failed_export_run_marks_every_chart_failed() {
    let mut engine = FakeEngine::default();
    engine.export_error = Some("notebook raised NameError".into());
    let charts = [desc("a", ChartLibrary::Altair), desc("b", ChartLibrary::Plotly)];

    let v = VisualValidator::new(Arc::new(engine));
    let r = v.validate(&ctx(false, Arc::default()), &charts).unwrap();
    assert_eq!(r.status, Status::Warn);
    assert_eq!(r.metrics["failed"], 2.0);
    assert_eq!(r.metrics["exported"], 0.0);
    assert_eq!(
        r.messages,
        vec![
            "a: altair export failed: notebook raised NameError".to_string(),
            "b: plotly export failed: notebook raised NameError".to_string(),
        ]
    );

    let strict = v.validate(&ctx(true, Arc::default()), &charts).unwrap();
    assert_eq!(strict.status, Status::Fail);
}
