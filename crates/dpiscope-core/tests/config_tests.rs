//! Integration tests for configuration and policy files

use dpiscope_core::config::Config;
use dpiscope_core::policy::{PolicySet, TlsStage};
use dpiscope_core::Error;
use std::io::Write;
use std::net::IpAddr;

fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    path
}

// ====== Config File Tests ======

#[test]
fn test_load_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "dpiscope.toml",
        r#"
[selector]
min_confidence = 60
high_risk_min_confidence = 75

[apply]
timeout_ms = 3000
allow_dns_changes = true

[logging]
level = "debug"
"#,
    );

    let config = Config::load(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.selector.min_confidence, 60);
    assert_eq!(config.apply.timeout().as_millis(), 3000);
    assert!(config.apply.allow_dns_changes);
    assert_eq!(config.apply.session_memory, 64);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_invalid_config_names_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "bad.toml", "[apply]\ntimeout_ms = 0\n");
    let err = Config::load(&path).unwrap().validate().unwrap_err();
    assert!(matches!(err, Error::ConfigValue { ref key, .. } if key == "apply.timeout_ms"));
}

#[test]
fn test_saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.signals.window_secs = 45;
    config.signals.extended_window_secs = 90;
    let path = write_file(&dir, "saved.toml", &config.to_toml().unwrap());
    assert_eq!(Config::load(&path).unwrap(), config);
}

// ====== Policy File Tests ======

#[test]
fn test_policy_file_compiles_and_evaluates() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "policies.toml",
        r#"
[[policy]]
id = "quic-fallback"
priority = 10
action = { kind = "Strategy", strategy_id = "drop_udp_443" }
[policy.match]
proto = "Udp"
port = 443

[[policy]]
id = "tls-split"
action = { kind = "Strategy", strategy_id = "tls_bypass", parameters = { tls_strategy = "fragment" } }
[policy.match]
proto = "Tcp"
port = 443
tls_stage = "ClientHello"
"#,
    );

    let set = PolicySet::load(&path).unwrap();
    assert_eq!(set.policies.len(), 2);
    let graph = set.compile().unwrap();
    let dst: IpAddr = "203.0.113.7".parse().unwrap();

    let udp = graph.evaluate_udp443(dst).unwrap();
    assert_eq!(udp.id, "quic-fallback");
    assert!(udp.action.drops_packet());

    let tls = graph.evaluate_tcp443_client_hello(dst, TlsStage::ClientHello, Some("www.example.com")).unwrap();
    assert_eq!(tls.id, "tls-split");
}

#[test]
fn test_conflicting_policy_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "conflict.toml",
        r#"
[[policy]]
id = "a"
action = { kind = "Pass" }
[policy.match]
proto = "Udp"
port = 443

[[policy]]
id = "b"
action = { kind = "Block" }
[policy.match]
proto = "Udp"
"#,
    );

    let err = PolicySet::load(&path).unwrap().compile().unwrap_err();
    assert_eq!(err.conflicts.len(), 1);
    assert_eq!((err.conflicts[0].policy_a.as_str(), err.conflicts[0].policy_b.as_str()), ("a", "b"));
}

#[test]
fn test_missing_policy_file() {
    let err = PolicySet::load(std::path::Path::new("/definitely/not/policies.toml")).unwrap_err();
    assert!(matches!(err, Error::ConfigNotFound { .. }));
}
