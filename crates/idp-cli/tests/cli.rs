#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn idp(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("idp").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("IDP_CONFIG")
        .env_remove("IDP_ENGINE")
        .env_remove("IDP_PORT")
        .env("IDP_URL", "http://127.0.0.1:9");
    cmd
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

#[test]
fn config_show_prints_defaults() {
    let dir = TempDir::new().unwrap();
    idp(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mode: direct"))
        .stdout(predicate::str::contains("interval_secs: 5"));
}

#[test]
fn config_validate_accepts_defaults() {
    let dir = TempDir::new().unwrap();
    idp(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_reports_errors() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("idp.yaml"), "mirror:\n  interval_secs: 0\n").unwrap();
    idp(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] mirror.interval_secs"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_flag_and_env_select_the_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.yaml");
    std::fs::write(&path, "engine:\n  mode: delegated\n").unwrap();

    idp(&dir)
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("mode: delegated"));

    idp(&dir)
        .env("IDP_CONFIG", &path)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mode: delegated"));
}

#[test]
fn config_init_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    idp(&dir).args(["config", "init"]).assert().success();
    assert!(dir.path().join("idp.yaml").exists());

    idp(&dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    idp(&dir)
        .args(["config", "init", "--force"])
        .assert()
        .success();
}

// ---------------------------------------------------------------------------
// node-pools
// ---------------------------------------------------------------------------

#[test]
fn node_pools_lists_builtin_table() {
    let dir = TempDir::new().unwrap();
    idp(&dir)
        .arg("node-pools")
        .assert()
        .success()
        .stdout(predicate::str::contains("NAME"))
        .stdout(predicate::str::contains("standard"));
}

#[test]
fn node_pools_json_is_an_object() {
    let dir = TempDir::new().unwrap();
    let output = idp(&dir).args(["node-pools", "--json"]).output().unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(value["standard"].is_object(), "{value}");
}

// ---------------------------------------------------------------------------
// argument errors
// ---------------------------------------------------------------------------

#[test]
fn unknown_engine_mode_is_rejected() {
    let dir = TempDir::new().unwrap();
    idp(&dir)
        .args(["serve", "--engine", "batch"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown engine mode"));
}

#[test]
fn unknown_workflow_type_is_rejected() {
    let dir = TempDir::new().unwrap();
    idp(&dir)
        .args(["workflow", "create", "cluster-upgrade"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown workflow type"));
}

#[test]
fn malformed_set_pair_is_rejected() {
    let dir = TempDir::new().unwrap();
    idp(&dir)
        .args(["workflow", "create", "cluster-deletion", "--set", "clusterName"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

#[test]
fn unreachable_server_is_reported() {
    let dir = TempDir::new().unwrap();
    idp(&dir)
        .args(["workflow", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to reach IDP API at http://127.0.0.1:9"));
}
