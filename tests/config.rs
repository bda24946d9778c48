use marimo_guard::{
    config::{Config, parse_bool},
    error::GuardError,
    probe::PhaseId,
};
use std::collections::HashMap;
use std::time::Duration;

#[test]
fn parse_example_config() {
    let raw = include_str!("../marimo-guard.example.toml");
    let cfg = Config::parse(raw).expect("parse TOML");
    cfg.validate().expect("example config is valid");
    assert_eq!(cfg.guard_loop.max_iters, 3);
    assert!(!cfg.mcp.url.is_empty());
}

#[test]
fn namespaced_table_is_unwrapped() {
    let cfg = Config::parse("[marimo_guard.check]\nstrict = true\ntimeout_seconds = 9\n").unwrap();
    assert!(cfg.check.strict);
    assert_eq!(
        cfg.phase_config(PhaseId::Check).timeout,
        Duration::from_secs(9)
    );
    // Untouched sections keep their defaults.
    assert_eq!(cfg.ui.dom_samples, 3);
}

#[test]
fn env_overrides_file_values() {
    let mut cfg = Config::parse("[mcp]\nurl = \"http://file:1/mcp/server\"\n[ui]\nstrict = false\n").unwrap();
    let env: HashMap<&str, &str> = HashMap::from([
        ("MARIMO_GUARD_UI_STRICT", "yes"),
        ("MARIMO_GUARD_MCP_URL", "http://env:2/mcp/server"),
        ("MARIMO_GUARD_FAIL_ON_WARN", "maybe"),
        ("MARIMO_GUARD_UI_PORT", "2800"),
    ]);
    cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

    assert!(cfg.ui.strict);
    assert!(cfg.ui.enabled);
    assert_eq!(cfg.ui.port, Some(2800));
    assert_eq!(cfg.mcp.url, "http://env:2/mcp/server");
    // Unparseable values leave the setting alone.
    assert!(!cfg.check.strict);
}

#[test]
fn invalid_values_are_rejected_before_running() {
    let cfg = Config::parse("[smoke]\ntimeout_seconds = 0\n").unwrap();
    let err = cfg.validate().unwrap_err();
    assert!(matches!(err, GuardError::ConfigInvalid(_)));
    assert_eq!(err.exit_code(), 2);

    let cfg = Config::parse("[guard_loop]\nmax_iters = 0\n").unwrap();
    assert!(cfg.validate().is_err());
}

#[test]
fn bool_parsing_accepts_common_spellings() {
    for t in ["1", "true", "YES", " on "] {
        assert_eq!(parse_bool(t), Some(true));
    }
    for f in ["0", "False", "no", "off"] {
        assert_eq!(parse_bool(f), Some(false));
    }
    assert_eq!(parse_bool("sometimes"), None);
}
