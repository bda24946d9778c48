use marimo_guard::{
    pipeline::PhaseOutcome,
    probe::{PhaseConfig, PhaseId, ProbeResult, Status},
    report::{Report, RunMeta, SCHEMA_VERSION, SelfTestInput, aggregate, report_path},
    selftest::SelfTest,
};
use std::path::Path;
use std::time::Duration;

#[test]
fn persisted_report_reads_back_identically() {
    let outcomes = vec![
        PhaseOutcome {
            phase: PhaseId::Check,
            config: PhaseConfig::new(true, false, Duration::from_secs(60)),
            result: ProbeResult::pass().with_metric("rc", 0.0),
            duration: Duration::from_millis(120),
        },
        PhaseOutcome {
            phase: PhaseId::Ui,
            config: PhaseConfig::new(true, true, Duration::from_secs(20)),
            result: ProbeResult::new(Status::Warn)
                .with_message("console error: boom")
                .with_artifact("screenshot", "logs/guard_ui_demo.png"),
            duration: Duration::from_millis(900),
        },
    ];
    let report = aggregate(
        outcomes,
        SelfTestInput::Present(SelfTest {
            ok: true,
            errors: vec![],
        }),
        true,
        RunMeta {
            notebook: Some("demo.py".into()),
            generated_at: Some("2026-01-01T00:00:00Z".into()),
            ..RunMeta::default()
        },
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = report_path(&dir.path().join("logs"), Path::new("notes/demo.py"));
    assert!(path.ends_with("logs/marimo_guard_demo.json"));
    report.write(&path).unwrap();
    let back = Report::read(&path).unwrap();

    assert_eq!(back.schema_version, SCHEMA_VERSION);
    assert_eq!(back.ok, report.ok);
    assert!(!back.ok);
    for phase in PhaseId::CANONICAL {
        assert_eq!(back.phase(phase).status, report.phase(phase).status, "{phase}");
    }
    assert_eq!(back, report);
}

#[test]
fn unknown_fields_are_ignored_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r.json");
    std::fs::write(
        &path,
        r#"{"schema_version":"1.1","ok":true,"warnings":[],"future_field":{"x":1},
            "check":{"status":"pass","new_metric_kind":[1,2]}}"#,
    )
    .unwrap();
    let r = Report::read(&path).unwrap();
    assert!(r.ok);
    assert_eq!(r.check.status, Status::Pass);
    assert_eq!(r.run.status, Status::Skipped);
}
