use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

const SERVICE: &str = "library_service";

fn bin(config: &Path) -> Command {
    let path = assert_cmd::cargo::cargo_bin!("steward");
    let mut cmd = Command::new(path);
    for var in [
        "STEWARD_CONFIG",
        "STEWARD_CONFIG_DIR",
        "STEWARD_RUNTIME_DIR",
        "STEWARD_SERVICE_SOURCE",
        "STEWARD_DIRTY_POLICY",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd.arg("--config").arg(config);
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Local seed tree shaped like the managed service's repository.
fn make_seed(root: &Path) -> PathBuf {
    let seed = root.join("seed");
    fs::create_dir_all(seed.join("service_scripts")).unwrap();
    fs::create_dir_all(seed.join(".venv/bin")).unwrap();
    fs::create_dir_all(seed.join("library_templates/Base_Library/projects")).unwrap();
    fs::write(seed.join("service_scripts/start_with_venv.py"), "print('start')\n").unwrap();
    fs::write(seed.join(".venv/bin/python"), "").unwrap();
    fs::write(seed.join(".env-example"), "# service settings\nCUSTOM_FLAG=on\nPROCESS_PORT=1\n").unwrap();
    fs::write(
        seed.join("library_templates/Base_Library/README.md"),
        "welcome\n",
    )
    .unwrap();
    fs::write(
        seed.join("library_templates/Base_Library/projects/AGENT.md"),
        "agent\n",
    )
    .unwrap();
    seed
}

fn write_config(dir: &TempDir, source: &Path, port: u16) -> PathBuf {
    let config_path = dir.path().join("config.yaml");
    fs::write(
        &config_path,
        format!(
            "version: 1\nruntime_dir: {}\nhealth:\n  attempts: 1\n  delay_ms: 10\n  timeout_sec: 1\nservices:\n  {SERVICE}:\n    source: {}\n    port: {port}\n    interpreter: python3\n",
            dir.path().join("runtime").display(),
            source.display(),
        ),
    )
    .unwrap();
    config_path
}

fn synced_workspace() -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let seed = make_seed(dir.path());
    let config = write_config(&dir, &seed, closed_port());
    bin(&config)
        .args(["--json", "sync", SERVICE])
        .assert()
        .success();
    (dir, config)
}

#[test]
fn services_lists_configured_service() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir, &dir.path().join("seed"), 18999);
    let output = bin(&config)
        .args(["--json", "services"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], true);
    let services = json["result"]["services"].as_array().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["key"], SERVICE);
    assert_eq!(services[0]["health_url"], "http://127.0.0.1:18999/health");
}

#[test]
fn sync_copies_local_seed_then_reports_existing() {
    let dir = tempdir().unwrap();
    let seed = make_seed(dir.path());
    let config = write_config(&dir, &seed, closed_port());

    let output = bin(&config)
        .args(["--json", "sync", SERVICE])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["action"], "copied");
    let repo = dir.path().join("runtime/Library-Service");
    assert!(repo.join("service_scripts/start_with_venv.py").is_file());
    assert!(!repo.join(".venv").exists());

    let again = bin(&config)
        .args(["--json", "sync", SERVICE])
        .output()
        .unwrap();
    let json = parse_json(&again.stdout);
    assert_eq!(json["result"]["action"], "existing");
    assert_eq!(json["result"]["steps"].as_array().unwrap().len(), 0);
}

#[test]
fn first_sync_with_update_copies_local_seed() {
    let dir = tempdir().unwrap();
    let seed = make_seed(dir.path());
    let config = write_config(&dir, &seed, closed_port());
    let output = bin(&config)
        .args(["--json", "sync", SERVICE, "--update"])
        .env("PATH", "")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["action"], "copied");
    assert_eq!(json["result"]["updated"], false);
    assert_eq!(json["result"]["is_git_repo"], false);
    assert!(dir
        .path()
        .join("runtime/Library-Service/service_scripts/start_with_venv.py")
        .is_file());
}

#[test]
fn sync_update_of_copied_tree_is_not_a_git_repo() {
    if which::which("git").is_err() {
        return;
    }
    let (_dir, config) = synced_workspace();
    let output = bin(&config)
        .args(["--json", "sync", SERVICE, "--update"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error_details"]["error_code"], "not_git_repo");
}

#[test]
fn env_materialize_keeps_unmanaged_lines_and_is_idempotent() {
    let (dir, config) = synced_workspace();
    let env_path = dir.path().join("runtime/Library-Service/.env");

    let first = bin(&config)
        .args(["--json", "env", "materialize", SERVICE, "--set", "EXTRA=1"])
        .output()
        .unwrap();
    assert!(first.status.success());
    let json = parse_json(&first.stdout);
    assert_eq!(json["result"]["changed"], true);
    let text = fs::read_to_string(&env_path).unwrap();
    assert!(text.starts_with("# service settings\nCUSTOM_FLAG=on\n"));
    assert!(text.contains("PROCESS_PORT=\""));
    assert!(text.contains("EXTRA=\"1\""));

    let second = bin(&config)
        .args(["--json", "env", "materialize", SERVICE, "--set", "EXTRA=1"])
        .output()
        .unwrap();
    let json = parse_json(&second.stdout);
    assert_eq!(json["result"]["changed"], false);
    assert!(json["result"].get("backup_path").is_none());
    assert_eq!(fs::read_to_string(&env_path).unwrap(), text);
}

#[test]
fn env_materialize_backs_up_changed_file() {
    let (dir, config) = synced_workspace();
    let repo = dir.path().join("runtime/Library-Service");
    bin(&config)
        .args(["env", "materialize", SERVICE])
        .assert()
        .success();

    let output = bin(&config)
        .args(["--json", "env", "materialize", SERVICE, "--set", "PROCESS_HOST=0.0.0.0"])
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    let backup = PathBuf::from(json["result"]["backup_path"].as_str().unwrap());
    assert!(backup.starts_with(&repo));
    assert!(fs::read_to_string(backup).unwrap().contains("PROCESS_HOST=\"127.0.0.1\""));
}

#[test]
fn env_materialize_rejects_bad_assignment() {
    let (_dir, config) = synced_workspace();
    bin(&config)
        .args(["env", "materialize", SERVICE, "--set", "NOEQUALS"])
        .assert()
        .failure()
        .stderr(contains("KEY=VALUE"));
}

#[test]
fn env_keys_lists_template_and_managed_keys() {
    let (_dir, config) = synced_workspace();
    let output = bin(&config)
        .args(["--json", "env", "keys", SERVICE])
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    let keys: Vec<&str> = json["result"]["keys"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(keys[0], "CUSTOM_FLAG");
    assert_eq!(keys.iter().filter(|k| **k == "PROCESS_PORT").count(), 1);
    assert!(keys.contains(&"LIBRARY_BASE_TEMPLATE_PATH"));
}

#[test]
fn bootstrap_seeds_user_library_once() {
    let (dir, config) = synced_workspace();
    let output = bin(&config)
        .args(["--json", "bootstrap", SERVICE, "user_01"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["user_id"], "user_01");
    assert_eq!(
        json["result"]["changed_paths"],
        serde_json::json!(["README.md", "projects/AGENT.md"])
    );
    let scoped = dir.path().join("runtime/Library-Service/library/users/user_01");
    assert!(scoped.join("README.md").is_file());

    let again = bin(&config)
        .args(["--json", "bootstrap", SERVICE, "user_01"])
        .output()
        .unwrap();
    let json = parse_json(&again.stdout);
    assert_eq!(json["result"]["changed_paths"], serde_json::json!([]));
}

#[test]
fn bootstrap_rejects_invalid_user() {
    let (_dir, config) = synced_workspace();
    let output = bin(&config)
        .args(["--json", "bootstrap", SERVICE, "../x"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error_details"]["error_code"], "bootstrap_failed");
}

#[test]
fn health_on_closed_port_reports_unhealthy_without_failing() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir, &dir.path().join("seed"), closed_port());
    let output = bin(&config)
        .args(["--json", "health", SERVICE])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["success"], false);
    assert!(json["result"]["error"].is_string());
}

#[test]
fn precheck_reports_missing_environment() {
    let (_dir, config) = synced_workspace();
    let output = bin(&config)
        .args(["--json", "precheck", SERVICE])
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["success"], false);
    assert_eq!(
        json["result"]["missing"],
        serde_json::json!(["environment_interpreter"])
    );
}

#[test]
fn stop_without_source_tree_is_skipped() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir, &dir.path().join("seed"), closed_port());
    let output = bin(&config)
        .args(["--json", "stop", SERVICE])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["skipped"], true);
    assert_eq!(json["result"]["reason"], "repo_missing");
}

#[test]
fn unknown_service_exits_with_error_code() {
    let dir = tempdir().unwrap();
    let config = write_config(&dir, &dir.path().join("seed"), closed_port());
    let output = bin(&config)
        .args(["--json", "start", "nope"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let json = parse_json(&output.stdout);
    assert_eq!(json["error_details"]["error_code"], "unknown_service");

    bin(&config)
        .args(["precheck", "nope"])
        .assert()
        .failure()
        .stderr(contains("unknown service key: nope"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    fs::write(&config, "version: 1\nunexpected: true\n").unwrap();
    let output = bin(&config)
        .args(["--json", "services"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let json = parse_json(&output.stdout);
    assert_eq!(json["error_details"]["error_code"], "config_invalid");
}
