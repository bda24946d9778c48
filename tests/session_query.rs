mod common;

use common::FakeSessions;
use marimo_guard::{
    cancel::CancelToken,
    mcp::{ErrorsSummary, SessionService, parse_mcp_response},
    pipeline::{Orchestrator, Phase},
    probe::{PhaseConfig, PhaseContext, PhaseId, Status},
    probes::SessionQueryProbe,
    registry::ChartRegistry,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn ctx(strict: bool) -> PhaseContext {
    PhaseContext {
        phase: PhaseId::Mcp,
        notebook: PathBuf::from("/work/notebooks/demo.py"),
        project_root: PathBuf::from("/work"),
        config: PhaseConfig::new(true, strict, Duration::from_secs(15)),
        registry: Arc::new(ChartRegistry::new()),
        cancel: CancelToken::new(),
        deadline: Instant::now() + Duration::from_secs(15),
    }
}

fn with_errors() -> FakeSessions {
    FakeSessions {
        reachable: true,
        notebooks: vec![json!({"session_id": "s1", "file_path": "/elsewhere/demo.py"})],
        summary: ErrorsSummary {
            notebooks: BTreeMap::from([(
                "demo.py".to_string(),
                json!(["cell 3: NameError: x", "cell 7: ZeroDivisionError"]),
            )]),
            total_errors: 2,
        },
        summary_error: None,
    }
}

#[test]
fn unreachable_endpoint_warns_or_fails_by_strictness() {
    let probe = SessionQueryProbe::new(Arc::new(FakeSessions::default()), Duration::ZERO);
    let lenient = probe.query(&ctx(false)).unwrap();
    assert_eq!(lenient.status, Status::Warn);
    assert_eq!(lenient.metrics["reachable"], 0.0);

    let strict = probe.query(&ctx(true)).unwrap();
    assert_eq!(strict.status, Status::Fail);
    assert_eq!(strict.metrics["reachable"], 0.0);
}

#[test]
fn reported_errors_produce_one_message_each() {
    let probe = SessionQueryProbe::new(Arc::new(with_errors()), Duration::ZERO);
    let r = probe.query(&ctx(false)).unwrap();
    assert_eq!(r.status, Status::Warn);
    assert_eq!(r.messages.len(), 2);
    assert_eq!(r.metrics["reachable"], 1.0);
    assert!(r.details["active_session"].as_str().unwrap().contains("s1"));

    let strict = probe.query(&ctx(true)).unwrap();
    assert_eq!(strict.status, Status::Fail);
}

#[test]
fn reachable_without_errors_passes() {
    let sessions = FakeSessions {
        reachable: true,
        ..FakeSessions::default()
    };
    let r = SessionQueryProbe::new(Arc::new(sessions), Duration::ZERO)
        .query(&ctx(true))
        .unwrap();
    assert_eq!(r.status, Status::Pass);
    assert!(r.messages.is_empty());
}

#[test]
fn failing_errors_summary_is_a_finding_not_a_crash() {
    // A server without the session-query endpoint answers health checks
    // but rejects the prompt calls.
    let sessions = FakeSessions {
        reachable: true,
        summary_error: Some("POST http://127.0.0.1:2718/mcp/server/prompts/errors_summary: HTTP 404".into()),
        ..FakeSessions::default()
    };
    let probe = SessionQueryProbe::new(Arc::new(sessions), Duration::ZERO);

    let lenient = probe.query(&ctx(false)).unwrap();
    assert_eq!(lenient.status, Status::Warn);
    assert_eq!(lenient.metrics["reachable"], 1.0);
    assert!(lenient.messages[0].contains("HTTP 404"));
    assert!(lenient.details["error"].as_str().unwrap().contains("HTTP 404"));

    let strict = probe.query(&ctx(true)).unwrap();
    assert_eq!(strict.status, Status::Fail);
}

#[test]
fn failing_errors_summary_keeps_a_lenient_run_ok() {
    let sessions = FakeSessions {
        reachable: true,
        summary_error: Some("HTTP 404".into()),
        ..FakeSessions::default()
    };
    let phases = vec![Phase {
        id: PhaseId::Mcp,
        probe: Arc::new(SessionQueryProbe::new(Arc::new(sessions), Duration::ZERO)),
        config: PhaseConfig::new(true, false, Duration::from_secs(10)),
    }];
    let outcomes = Orchestrator::new(Arc::new(ChartRegistry::new()))
        .run(phases, Path::new("demo.py"), Path::new("."), &CancelToken::new())
        .unwrap();
    assert_eq!(outcomes[0].result.status, Status::Warn);
}

#[test]
fn mcp_envelope_is_unwrapped() {
    let wrapped = json!({"content": [{"type": "text", "text": "{\"total_errors\": 4}"}]});
    assert_eq!(parse_mcp_response(wrapped), json!({"total_errors": 4}));

    let plain = json!({"total_errors": 1});
    assert_eq!(parse_mcp_response(plain.clone()), plain);
}

#[test]
fn errors_are_looked_up_by_path_then_file_name() {
    let summary = ErrorsSummary {
        notebooks: BTreeMap::from([
            ("/a/b/nb.py".to_string(), json!("full-path error")),
            ("other.py".to_string(), json!(["x"])),
        ]),
        total_errors: 2,
    };
    assert_eq!(summary.errors_for(Path::new("/a/b/nb.py")), vec!["full-path error"]);
    assert_eq!(summary.errors_for(Path::new("/z/other.py")), vec!["x"]);
    assert!(summary.errors_for(Path::new("/z/none.py")).is_empty());
}

#[test]
fn session_service_parses_alternate_keys() {
    let sessions = FakeSessions {
        reachable: true,
        notebooks: vec![
            json!({"id": 7, "path": "/p/a.py", "status": "running"}),
            json!({"session_id": "x"}),
        ],
        ..FakeSessions::default()
    };
    let service = SessionService::new(&sessions);
    let active = service.active_sessions();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_id, "7");
    assert_eq!(active[0].status, "running");
    assert!(service.is_notebook_active(Path::new("/q/a.py")));
    assert!(service.warn_if_active(Path::new("/q/b.py")).is_none());
}
