//! CLI integration tests for smartflow
//!
//! Tests the smartflow CLI commands end-to-end using assert_cmd. None of
//! these reach the network.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Command isolated from the user's config, API keys, and .env files
#[allow(deprecated)]
fn smartflow_cmd(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("smartflow").unwrap();
    cmd.current_dir(config_dir.path());
    cmd.env("SMARTFLOW_CONFIG_DIR", config_dir.path());
    cmd.env_remove("SMARTFLOW_API_KEY");
    cmd.env_remove("OPENROUTER_API_KEY");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn test_prompt_encodes_preferences() {
    let dir = TempDir::new().unwrap();

    smartflow_cmd(&dir)
        .args([
            "prompt",
            "Plan a small CRM system",
            "--max-subtasks",
            "6",
            "--granularity",
            "coarse",
            "--focus",
            "security",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Task: Plan a small CRM system"))
        .stdout(predicate::str::contains("at most 6 ordered subtasks"))
        .stdout(predicate::str::contains("Merge similar"))
        .stdout(predicate::str::contains("security"));
}

#[test]
fn test_prompt_json_output() {
    let dir = TempDir::new().unwrap();
    let stdout = stdout_of(smartflow_cmd(&dir).args(["prompt", "Write a novel", "--format", "json"]));

    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(value["system"].as_str().unwrap().contains("JSON"));
    assert!(value["user"].as_str().unwrap().contains("at most 8 ordered subtasks"));
}

#[test]
fn test_prompt_rejects_zero_max_subtasks() {
    let dir = TempDir::new().unwrap();

    smartflow_cmd(&dir)
        .args(["prompt", "Write a novel", "--max-subtasks", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_subtasks"));
}

#[test]
fn test_unknown_granularity_is_rejected() {
    let dir = TempDir::new().unwrap();

    smartflow_cmd(&dir)
        .args(["prompt", "Write a novel", "--granularity", "extreme"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown granularity"));
}

#[test]
fn test_fingerprint_ignores_cosmetic_differences() {
    let dir = TempDir::new().unwrap();

    let a = stdout_of(smartflow_cmd(&dir).args(["fingerprint", "Plan a small CRM system"]));
    let b = stdout_of(smartflow_cmd(&dir).args(["fingerprint", "  plan a SMALL   crm system"]));
    let c = stdout_of(smartflow_cmd(&dir).args(["fingerprint", "Plan a small CRM system", "-g", "fine"]));

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.trim().len(), 64);
}

#[test]
fn test_fingerprint_json_output() {
    let dir = TempDir::new().unwrap();
    let stdout = stdout_of(smartflow_cmd(&dir).args(["fingerprint", " Book  Flights ", "--format", "json"]));

    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["normalizedDescription"], "book flights");
    assert_eq!(value["fingerprint"].as_str().unwrap().len(), 64);
}

#[test]
fn test_decompose_rejects_invalid_input_before_network() {
    let dir = TempDir::new().unwrap();

    smartflow_cmd(&dir)
        .args(["decompose", "Book flights", "--max-subtasks", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid preferences"));

    smartflow_cmd(&dir)
        .args(["decompose", "   "])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid request"));
}

#[test]
fn test_decompose_requires_api_key() {
    let dir = TempDir::new().unwrap();

    smartflow_cmd(&dir)
        .args(["decompose", "Book flights"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no API key configured"));
}

#[test]
fn test_config_list_shows_defaults() {
    let dir = TempDir::new().unwrap();

    smartflow_cmd(&dir)
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cache.capacity = 1024"))
        .stdout(predicate::str::contains("retry.max_attempts = 3"))
        .stdout(predicate::str::contains("circuit_breaker.failure_threshold = 5"));
}

#[test]
fn test_config_set_get_and_reset() {
    let dir = TempDir::new().unwrap();

    smartflow_cmd(&dir)
        .args(["config", "set", "retry.max_attempts", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set retry.max_attempts = 5"));
    assert!(dir.path().join("config.toml").exists());

    smartflow_cmd(&dir)
        .args(["config", "get", "retry.max_attempts"])
        .assert()
        .success()
        .stdout(predicate::str::diff("5\n"));

    smartflow_cmd(&dir).args(["config", "reset"]).assert().success();
    smartflow_cmd(&dir)
        .args(["config", "get", "retry.max_attempts"])
        .assert()
        .success()
        .stdout(predicate::str::diff("3\n"));
}

#[test]
fn test_config_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();

    smartflow_cmd(&dir)
        .args(["config", "set", "cache.capacity", "0"])
        .assert()
        .failure();

    smartflow_cmd(&dir)
        .args(["config", "set", "llm.api_key", "sk-secret"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("SMARTFLOW_API_KEY"));

    smartflow_cmd(&dir)
        .args(["config", "get", "no.such.key"])
        .assert()
        .failure();
}

#[test]
fn test_config_path_uses_config_dir() {
    let dir = TempDir::new().unwrap();

    smartflow_cmd(&dir)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_configured_max_subtasks_shapes_requests() {
    let dir = TempDir::new().unwrap();

    smartflow_cmd(&dir)
        .args(["config", "set", "decomposition.default_max_subtasks", "5"])
        .assert()
        .success();

    smartflow_cmd(&dir)
        .args(["prompt", "Write a novel"])
        .assert()
        .success()
        .stdout(predicate::str::contains("at most 5 ordered subtasks"));

    smartflow_cmd(&dir)
        .args(["prompt", "Write a novel", "--max-subtasks", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("at most 3 ordered subtasks"));
}

#[test]
fn test_decompose_logs_progress_and_falls_back_when_unreachable() {
    let dir = TempDir::new().unwrap();

    for (key, value) in [("llm.base_url", "http://127.0.0.1:1/v1"), ("retry.max_attempts", "1")] {
        smartflow_cmd(&dir).args(["config", "set", key, value]).assert().success();
    }

    smartflow_cmd(&dir)
        .env("SMARTFLOW_API_KEY", "sk-test")
        .args(["decompose", "Book flights"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Source: fallback"))
        .stderr(predicate::str::contains("Decomposing task"));
}
