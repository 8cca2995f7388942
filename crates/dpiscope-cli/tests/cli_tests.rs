//! End-to-end tests of the dpiscope binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn dpiscope(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("dpiscope").unwrap();
    cmd.current_dir(dir.path()).env_remove("DPISCOPE_CONFIG").env_remove("RUST_LOG");
    cmd
}

// ====== Config Tests ======

#[test]
fn test_config_init_then_validate() {
    let dir = TempDir::new().unwrap();

    dpiscope(&dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dpiscope.toml"));
    assert!(dir.path().join("dpiscope.toml").exists());

    // Discovered from the working directory
    dpiscope(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("bad.toml"), "[apply]\ndns_preset = \"Nowhere\"\n").unwrap();

    dpiscope(&dir)
        .args(["-c", "bad.toml", "config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("dns_preset"));
}

// ====== Policy Tests ======

#[test]
fn test_policy_check_reports_conflicts() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("policies.toml"),
        r#"
[[policy]]
id = "pass-quic"
action = { kind = "Pass" }
match = { proto = "Udp", port = 443 }

[[policy]]
id = "block-quic"
action = { kind = "Block" }
match = { proto = "Udp", port = 443 }
"#,
    )
    .unwrap();

    dpiscope(&dir)
        .args(["policy", "check", "policies.toml"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("pass-quic").and(predicate::str::contains("block-quic")));
}

#[test]
fn test_policy_check_probe() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("policies.toml"),
        r#"
[[policy]]
id = "quic-off"
priority = 10
action = { kind = "Strategy", strategy_id = "drop_udp_443" }
match = { proto = "Udp", port = 443 }
"#,
    )
    .unwrap();

    dpiscope(&dir)
        .args(["policy", "check", "policies.toml", "--udp443", "203.0.113.9"])
        .assert()
        .success()
        .stdout(predicate::str::contains("UDP/443 -> 203.0.113.9: quic-off"));
}

#[test]
fn test_policy_check_respects_destination_list() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("policies.toml"),
        r#"
[[policy]]
id = "quic-one-host"
action = { kind = "Strategy", strategy_id = "drop_udp_443" }
match = { proto = "Udp", port = 443, dst_ip_set = ["203.0.113.9"] }
"#,
    )
    .unwrap();

    dpiscope(&dir)
        .args(["policy", "check", "policies.toml", "--udp443", "198.51.100.1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("UDP/443 -> 198.51.100.1: no policy"));
}

// ====== Run Tests ======

#[test]
fn test_run_rejects_malformed_filter() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("results.jsonl"), "").unwrap();

    dpiscope(&dir)
        .args(["run", "--results", "results.jsonl", "--filter", "outbound and (tcp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid --filter"));
}

// ====== Diagnose Tests ======

#[test]
fn test_diagnose_json_from_stdin() {
    let dir = TempDir::new().unwrap();
    let input = concat!(
        r#"{"hostname":"blocked.example","remoteIp":"203.0.113.7","dnsOk":false,"tcpOk":false,"tlsOk":false,"testedAt":"2026-01-10T12:00:00Z"}"#,
        "\n",
        r#"{"hostname":"blocked.example","remoteIp":"203.0.113.7","dnsOk":false,"tcpOk":false,"tlsOk":false,"testedAt":"2026-01-10T12:00:05Z"}"#,
        "\n",
    );

    dpiscope(&dir)
        .args(["diagnose", "-", "--json"])
        .write_stdin(input)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"host\": \"203.0.113.7\"").and(predicate::str::contains("DnsHijack")));
}

#[test]
fn test_diagnose_missing_file() {
    let dir = TempDir::new().unwrap();
    dpiscope(&dir)
        .args(["diagnose", "nope.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.jsonl"));
}

// ====== Feedback Tests ======

#[test]
fn test_feedback_requires_path() {
    let dir = TempDir::new().unwrap();
    dpiscope(&dir)
        .args(["feedback", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("feedback.path"));
}

#[test]
fn test_feedback_show_empty_file() {
    let dir = TempDir::new().unwrap();
    dpiscope(&dir)
        .args(["feedback", "show", "--file", "feedback.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no outcomes recorded"));
}
