#![cfg(not(target_arch = "wasm32"))]

use std::process::{Command, Output};

use pretty_assertions::assert_eq;

fn pace(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pace"))
        .args(args)
        .output()
        .expect("failed to run pace binary")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "pace failed.\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout was not JSON")
}

#[test]
fn runs_round_robin_machine() {
    let output = pace(&[
        "--cpus",
        "3",
        "--thread",
        "single",
        "--kick-period-ms",
        "2",
        "--run-ms",
        "200",
        "--json",
    ]);
    let report = stdout_json(&output);

    assert_eq!(report["run_state"], "paused");
    assert_eq!(report["mttcg"], false);
    let cpus = report["cpus"].as_array().unwrap();
    assert_eq!(cpus.len(), 3);
    for cpu in cpus {
        assert_eq!(cpu["backend"], "round-robin");
        assert_eq!(cpu["thread"], "ALL CPUs/TCG");
    }
    assert!(report["total_instructions"].as_u64().unwrap() > 0);
    assert!(report["drift"].is_null());
}

#[test]
fn icount_reports_drift() {
    let output = pace(&["--cpus", "2", "--icount", "shift=4", "--run-ms", "100", "--json"]);
    let report = stdout_json(&output);
    assert!(report["drift"]["host_minus_guest_ms"].is_i64());
    assert!(report["drift"]["max_delay_ms"].is_null());
}

#[test]
fn quantum_record_writes_samples() {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let file = tmp.path().join("quantum.jsonl");
    let opts = format!("core=5K,record=200K,step=50K,file={}", file.display());
    let output = pace(&[
        "--cpus", "2", "--thread", "multi", "--quantum", &opts, "--run-ms", "300", "--json",
    ]);
    let report = stdout_json(&output);
    assert!(report["quantum"]["0"]["slices"].as_u64().unwrap() > 0);

    let samples = std::fs::read_to_string(&file).expect("quantum file not written");
    let first: serde_json::Value = serde_json::from_str(samples.lines().next().unwrap()).unwrap();
    assert_eq!(first["total_instructions"], 50_000);
}

#[test]
fn print_config_shows_icount_settings() {
    let output = pace(&["--icount", "shift=auto", "--print-config"]);
    let config = stdout_json(&output);
    assert_eq!(config["icount"]["sleep"], true);
    assert_eq!(config["thread"], serde_json::Value::Null);
}

#[test]
fn rejects_multi_threaded_icount() {
    let output = pace(&["--thread", "multi", "--icount", "shift=3", "--print-config"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("No MTTCG when icount is enabled"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn qtest_warp_advances_virtual_time() {
    let output = pace(&[
        "--engine",
        "qtest",
        "--icount",
        "shift=0",
        "--warp-ns",
        "5000000",
        "--run-ms",
        "10",
        "--json",
    ]);
    let report = stdout_json(&output);
    assert!(report["virtual_ns"].as_i64().unwrap() >= 5_000_000);
    assert_eq!(report["cpus"][0]["backend"], "dummy");
}
