mod common;

use common::{FakeEngine, FakeLauncher, FakeSessions, chart, project};
use marimo_guard::{
    cancel::CancelToken,
    config::Config,
    engine::{BrowseOut, CheckOut},
    pipeline::{Collaborators, Pipeline},
    probe::{PhaseId, Status},
    report::Report,
    selftest,
};
use std::collections::BTreeMap;
use std::sync::Arc;

const NOTEBOOK: &str = "import marimo\napp = marimo.App()\n";

fn base_config() -> Config {
    let mut cfg = Config::default();
    cfg.selftest.require = false;
    cfg.smoke.seconds = 0;
    cfg
}

fn pipeline(cfg: &Config, engine: FakeEngine) -> Pipeline {
    Pipeline::new(
        cfg,
        Collaborators {
            engine: Arc::new(engine),
            launcher: Arc::new(FakeLauncher::default()),
            sessions: Arc::new(FakeSessions::default()),
        },
    )
}

#[test]
fn syntax_error_fails_check_and_skips_the_rest() {
    let (_dir, nb) = project("def broken(:\n");
    let mut engine = FakeEngine::default();
    engine.check = CheckOut {
        rc: 1,
        stdout: "demo.py:1: SyntaxError: invalid syntax\n".into(),
        stderr: String::new(),
    };
    let p = pipeline(&base_config(), engine);
    let report = p.run(&nb, &CancelToken::new()).unwrap();

    assert!(!report.ok);
    assert_ne!(report.exit_code(), 0);
    assert_eq!(report.check.status, Status::Fail);
    for phase in &PhaseId::CANONICAL[1..] {
        assert_eq!(report.phase(*phase).status, Status::Skipped, "{phase}");
    }

    let persisted = Report::read(&p.report_path(&nb)).unwrap();
    assert_eq!(persisted.check.status, Status::Fail);
    assert!(!persisted.ok);
}

#[test]
fn clean_notebook_with_one_chart_passes() {
    let (_dir, nb) = project(NOTEBOOK);
    let mut engine = FakeEngine::default();
    engine.execute.charts = vec![chart("sales", "altair")];
    let p = pipeline(&base_config(), engine);
    let report = p.run(&nb, &CancelToken::new()).unwrap();

    assert!(report.ok, "{}", report.failure_summary());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.check.status, Status::Pass);
    assert_eq!(report.app_run.status, Status::Pass);
    assert_eq!(report.visual_validation.status, Status::Pass);
    assert_eq!(report.visual_validation.metrics["exported"], 1.0);
    assert_eq!(report.run.status, Status::Pass);
    assert_eq!(report.ui.status, Status::Skipped);
    assert_eq!(report.mcp.status, Status::Skipped);
    assert!(report.notebook_sha256.is_some());
    assert_eq!(report.schema_version, "1.1");
}

#[test]
fn strict_ui_console_error_fails_only_the_ui_phase() {
    let (_dir, nb) = project(NOTEBOOK);
    let mut cfg = base_config();
    cfg.ui.enabled = true;
    cfg.ui.strict = true;
    cfg.ui.port = Some(45311);

    let mut engine = FakeEngine::default();
    engine.execute.charts = vec![chart("sales", "altair")];
    engine.browse = BrowseOut {
        console_errors: vec!["Uncaught ReferenceError: vegaEmbed is not defined".into()],
        dom: BTreeMap::from([(
            "altair".to_string(),
            BTreeMap::from([("[role=\"graphics-document\"]".to_string(), 1)]),
        )]),
        screenshot: Some("logs/guard_ui_demo.png".into()),
        html: Some("logs/guard_ui_demo.html".into()),
        ..BrowseOut::default()
    };
    let report = pipeline(&cfg, engine)
        .run(&nb, &CancelToken::new())
        .unwrap();

    assert!(!report.ok);
    assert_eq!(report.ui.status, Status::Fail);
    assert!(report.ui.strict);
    assert!(report.ui.artifacts.contains_key("screenshot"));
    assert!(report.ui.artifacts.contains_key("html"));
    for phase in [PhaseId::Check, PhaseId::AppRun, PhaseId::VisualValidation, PhaseId::Run] {
        assert_eq!(report.phase(phase).status, Status::Pass, "{phase}");
    }
}

#[test]
fn stale_selftest_is_cleared_and_missing_one_is_an_error() {
    let (_dir, nb) = project(NOTEBOOK);
    let mut cfg = base_config();
    cfg.selftest.require = true;
    let p = pipeline(&cfg, FakeEngine::default());
    let stale = selftest::artifact_path(&p.logs_dir(&nb), &nb);
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, r#"{"ok": true, "errors": []}"#).unwrap();

    let report = p.run(&nb, &CancelToken::new()).unwrap();
    assert!(!report.ok);
    assert!(report.error.as_deref().unwrap().contains("selftest artifact missing"));
    assert_eq!(report.check.status, Status::Pass);
}

#[test]
fn selftest_written_during_execution_is_honoured() {
    let (_dir, nb) = project(NOTEBOOK);
    let mut cfg = base_config();
    cfg.selftest.require = true;

    let probe_cfg = pipeline(&cfg, FakeEngine::default());
    let path = selftest::artifact_path(&probe_cfg.logs_dir(&nb), &nb);

    let mut engine = FakeEngine::default();
    engine.writes_on_execute = Some((path.clone(), r#"{"ok": true, "errors": []}"#.into()));
    let report = pipeline(&cfg, engine).run(&nb, &CancelToken::new()).unwrap();
    assert!(report.ok, "{}", report.failure_summary());
    assert!(report.selftest.unwrap().ok);

    let mut engine = FakeEngine::default();
    engine.writes_on_execute = Some((path, "not json".into()));
    let report = pipeline(&cfg, engine).run(&nb, &CancelToken::new()).unwrap();
    assert!(!report.ok);
    assert!(!report.selftest.unwrap().ok);
}

#[test]
fn missing_notebook_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = pipeline(&base_config(), FakeEngine::default())
        .run(&dir.path().join("nope.py"), &CancelToken::new())
        .unwrap_err();
    assert_eq!(marimo_guard::error::GuardError::exit_code_for(&err), 2);
}
