mod common;

use common::FakeLauncher;
use marimo_guard::{
    cancel::CancelToken,
    config::Watch,
    preview::PreviewMode,
    report::{Report, RunMeta, SelfTestInput, aggregate},
    watch::{FileMonitor, WatchController, local_imports},
};
use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::time::Duration;

fn ok_report() -> Report {
    aggregate(
        vec![],
        SelfTestInput::Absent {
            expected_at: PathBuf::from("x"),
        },
        false,
        RunMeta::default(),
    )
    .unwrap()
}

fn watch_cfg() -> Watch {
    Watch {
        port: 45200,
        poll_ms: 20,
        debounce_ms: 20,
        ..Watch::default()
    }
}

#[test]
fn burst_of_changes_coalesces_into_one_run() {
    let (tx, rx) = mpsc::channel();
    for _ in 0..5 {
        tx.send(PathBuf::from("demo.py")).unwrap();
    }
    let launcher = FakeLauncher::default();
    let log = launcher.log.clone();
    let controller = WatchController::new(Arc::new(launcher), &PathBuf::from("demo.py"), &watch_cfg());

    let cancel = CancelToken::new();
    let mut runs = 0;
    let summary = controller
        .drive(
            &rx,
            |c| {
                runs += 1;
                c.cancel();
                Ok(ok_report())
            },
            &cancel,
        )
        .unwrap();

    assert_eq!(runs, 1);
    assert_eq!(summary.runs, 1);
    assert_eq!(summary.changes, 5);
    assert_eq!(summary.restarts, 1);
    assert_eq!(log.launches(), 2);
    assert_eq!(log.shutdowns(), 2);
    assert!(log.modes.lock().unwrap().iter().all(|m| *m == PreviewMode::Edit));
}

#[test]
fn changes_during_a_run_queue_a_single_follow_up() {
    let (tx, rx) = mpsc::channel();
    tx.send(PathBuf::from("demo.py")).unwrap();
    let controller = WatchController::new(
        Arc::new(FakeLauncher::default()),
        &PathBuf::from("demo.py"),
        &watch_cfg(),
    );
    let cancel = CancelToken::new();
    let mut runs = 0;
    let summary = controller
        .drive(
            &rx,
            |c| {
                runs += 1;
                if runs == 1 {
                    // Three saves land while the first run is busy.
                    for _ in 0..3 {
                        tx.send(PathBuf::from("demo.py")).unwrap();
                    }
                } else {
                    c.cancel();
                }
                Ok(ok_report())
            },
            &cancel,
        )
        .unwrap();
    assert_eq!(summary.runs, 2);
    assert_eq!(summary.changes, 4);
}

#[test]
fn monitor_reports_content_changes_only() {
    let dir = tempfile::tempdir().unwrap();
    let nb = dir.path().join("demo.py");
    std::fs::write(&nb, "a = 1\n").unwrap();

    let (tx, rx) = mpsc::channel();
    let cancel = CancelToken::new();
    let mut monitor = FileMonitor::start(vec![nb.clone()], Duration::from_millis(20), tx, &cancel).unwrap();

    std::thread::sleep(Duration::from_millis(60));
    std::fs::write(&nb, "a = 22\n").unwrap();
    let changed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(changed, nb);

    monitor.stop();
    assert!(!cancel.is_cancelled());
}

#[test]
fn local_imports_resolve_sibling_modules() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("helpers.py"), "X = 1\n").unwrap();
    std::fs::write(dir.path().join("plots.py"), "Y = 2\n").unwrap();
    let nb = dir.path().join("demo.py");
    std::fs::write(
        &nb,
        "import marimo\nimport helpers\nfrom plots import Y\nimport os\n",
    )
    .unwrap();

    let found = local_imports(&nb);
    assert_eq!(
        found,
        vec![dir.path().join("helpers.py"), dir.path().join("plots.py")]
    );
}

#[test]
fn local_imports_cover_comma_lists_and_relative_forms() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = dir.path().join("notebooks");
    std::fs::create_dir(&pkg).unwrap();
    for name in ["a.py", "b.py", "sibling.py", "c.py", "d.py"] {
        std::fs::write(pkg.join(name), "V = 1\n").unwrap();
    }
    std::fs::write(dir.path().join("shared.py"), "W = 1\n").unwrap();
    let nb = pkg.join("demo.py");
    std::fs::write(
        &nb,
        "import marimo as mo\n\
         import a, os, b as bee\n\
         @app.cell\n\
         def _():\n    from .sibling import x\n    return\n\
         from . import c, d as dee\n\
         from ..shared import W  # parent dir\n",
    )
    .unwrap();

    let found = local_imports(&nb);
    assert_eq!(
        found,
        vec![
            pkg.join("a.py"),
            pkg.join("b.py"),
            pkg.join("sibling.py"),
            pkg.join("c.py"),
            pkg.join("d.py"),
            dir.path().join("shared.py"),
        ]
    );
}
