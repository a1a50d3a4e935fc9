//! End-to-end tests for the spawntrace binary

use std::fs;
use std::process::{Command, Output};

use tempfile::TempDir;

/// Run spawntrace with an isolated HOME and working directory so no user
/// config leaks in.
fn spawntrace(dir: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_spawntrace"))
        .args(args)
        .current_dir(dir.path())
        .env("HOME", dir.path())
        .env_remove("SPAWNTRACE_ON_ERROR")
        .env_remove("SPAWNTRACE_MAX_THREADS")
        .env_remove("SPAWNTRACE_LOG")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute spawntrace")
}

const TWO_CHILDREN: &str = r#"{"event":"thread_start","thread":100}
{"event":"instruction","thread":100,"count":10}
{"event":"call_enter","site":"pthread_create","thread":100}
{"event":"call_return","site":"pthread_create","thread":100,"value":7}
{"event":"instruction","thread":100,"count":15}
{"event":"call_enter","site":"pthread_create","thread":100}
{"event":"call_return","site":"pthread_create","thread":100,"value":8}
{"event":"thread_start","thread":201,"parent":100}
{"event":"instruction","thread":201,"count":3}
{"event":"thread_start","thread":202,"parent":100}
{"event":"thread_finish","thread":201}
{"event":"thread_finish","thread":202}
{"event":"thread_finish","thread":100}
"#;

const LOST_SPAWN: &str = r#"{"event":"thread_start","thread":1}
{"event":"thread_start","thread":2,"parent":1}
{"event":"thread_finish","thread":2}
{"event":"thread_finish","thread":1}
"#;

fn write_log(dir: &TempDir, contents: &str) -> String {
    let path = dir.path().join("events.jsonl");
    fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn test_replay_json_report() {
    let dir = TempDir::new().unwrap();
    let log = write_log(&dir, TWO_CHILDREN);

    let output = spawntrace(&dir, &["replay", &log, "--format", "json"]);
    assert!(output.status.success(), "{:?}", output);

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = report["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["spawn_call_count"], 10);
    assert_eq!(rows[0]["child_handle"], 7);
    assert_eq!(rows[0]["self_instruction_count"], 3);
    assert_eq!(rows[1]["spawn_call_count"], 25);
    assert_eq!(report["roots"][0]["self_instruction_count"], 25);
    assert!(report["gaps"].as_array().unwrap().is_empty());
}

#[test]
fn test_replay_table_report() {
    let dir = TempDir::new().unwrap();
    let log = write_log(&dir, TWO_CHILDREN);

    let output = spawntrace(&dir, &["replay", &log]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Child Thread"));
    assert!(stdout.contains("pthread_create at"));
    assert!(stdout.contains("External ID"));
}

#[test]
fn test_replay_abort_prints_partial_report_and_fails() {
    let dir = TempDir::new().unwrap();
    let log = write_log(&dir, LOST_SPAWN);

    let output = spawntrace(&dir, &["replay", &log, "--format", "json"]);
    assert!(!output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["halted"], true);
    assert_eq!(report["faults"][0]["error"]["kind"], "no_pending_spawn");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Trace halted"));
}

#[test]
fn test_replay_continue_keeps_orphan() {
    let dir = TempDir::new().unwrap();
    let log = write_log(&dir, LOST_SPAWN);

    let output = spawntrace(
        &dir,
        &["replay", &log, "--on-error", "continue", "--format", "json"],
    );
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["halted"], false);
    assert_eq!(report["rows"][0]["spawn_call_count"], serde_json::Value::Null);
    assert_eq!(report["gaps"][0]["kind"], "missing_spawn_call");
}

#[test]
fn test_project_config_sets_policy() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join(".spawntrace")).unwrap();
    fs::write(
        dir.path().join(".spawntrace/config.toml"),
        "[tracker]\non_error = \"continue\"\n",
    )
    .unwrap();
    let log = write_log(&dir, LOST_SPAWN);

    let output = spawntrace(&dir, &["replay", &log, "--format", "json"]);
    assert!(output.status.success());
}

#[test]
fn test_replay_missing_file() {
    let dir = TempDir::new().unwrap();
    let output = spawntrace(&dir, &["replay", "nope.jsonl"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to open event log"));
}

#[test]
fn test_demo_small_tree() {
    let dir = TempDir::new().unwrap();
    let output = spawntrace(
        &dir,
        &["demo", "--threads", "2", "--depth", "2", "--work", "20", "--format", "json"],
    );
    assert!(output.status.success(), "{:?}", output);

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["rows"].as_array().unwrap().len(), 6);
    assert!(report["gaps"].as_array().unwrap().is_empty());
}

#[test]
fn test_demo_rejects_oversized_tree() {
    let dir = TempDir::new().unwrap();
    let output = spawntrace(&dir, &["demo", "--threads", "64", "--depth", "3"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("max_threads"));
}

#[test]
fn test_config_default_outputs_sections() {
    let dir = TempDir::new().unwrap();
    let output = spawntrace(&dir, &["config", "default"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[tracker]"));
    assert!(stdout.contains("[hooks]"));
    assert!(stdout.contains("on_error = \"abort\""));
}

#[test]
fn test_replay_counter_overflow_reports_partial_snapshot() {
    let dir = TempDir::new().unwrap();
    let log = write_log(
        &dir,
        "{\"event\":\"thread_start\",\"thread\":1}\n\
         {\"event\":\"instruction\",\"thread\":1,\"count\":18446744073709551615}\n\
         {\"event\":\"instruction\",\"thread\":1,\"count\":1}\n",
    );

    let output = spawntrace(&dir, &["replay", &log, "--format", "json"]);
    assert!(!output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["halted"], true);
    assert_eq!(report["faults"][0]["error"]["kind"], "counter_overflow");
}

#[test]
fn test_demo_rejects_overflowing_tree() {
    let dir = TempDir::new().unwrap();
    let output = spawntrace(&dir, &["demo", "--threads", "100000", "--depth", "8"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("too large"));
}
