//! Integration tests for the `lorabatch` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

/// Lay out a base directory with program/, training/ and an env file that
/// never touches a real remote.
fn setup(temp: &TempDir, accelerate: &str) -> std::path::PathBuf {
    let base = temp.path();
    std::fs::create_dir_all(base.join("program")).unwrap();
    std::fs::create_dir_all(base.join("training")).unwrap();
    std::fs::write(base.join("program/train.toml"), "learning_rate = 0.0001\nmax_train_epochs = 10\n").unwrap();
    std::fs::create_dir_all(base.join("models")).unwrap();
    std::fs::write(base.join("models/base.safetensors"), "weights").unwrap();

    let env = format!(
        r#"
[paths]
base_directory = "{base}"
temp_directory = "{base}/tmp"
kohya_directory = "{base}/kohya_missing"
accelerate_path = "{accelerate}"
output_dir = "output"
model_dir = "models"
pretrained_model_name_or_path = "base.safetensors"

[makelora_settings]
output_suffix = "v1"
train_config_file = "train.toml"

[rclone]
binary = "definitely-not-rclone-xyz"
empty_trash_on_start = false
download_on_start = false
empty_trash_after_upload = false
"#,
        base = base.display(),
    );
    let env_file = base.join("PSPACE_env.toml");
    std::fs::write(&env_file, env).unwrap();
    env_file
}

#[cfg(unix)]
fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[test]
fn test_help() {
    let mut cmd = Command::cargo_bin("lorabatch").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check-remote"))
        .stdout(predicate::str::contains("download-model"));
}

#[test]
fn test_run_help_lists_flags() {
    let mut cmd = Command::cargo_bin("lorabatch").unwrap();
    cmd.args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--add"))
        .stdout(predicate::str::contains("--test"))
        .stdout(predicate::str::contains("--json"));
}

#[test]
fn test_missing_env_file_fails() {
    let temp = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("lorabatch").unwrap();
    cmd.current_dir(temp.path())
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("PSPACE_env.toml"));
}

#[test]
fn test_missing_suffix_is_rejected() {
    let temp = TempDir::new().unwrap();
    let env_file = temp.path().join("env.toml");
    std::fs::write(&env_file, "[paths]\noutput_dir = \"output\"\n[makelora_settings]\ntrain_config_file = \"train.toml\"\n")
        .unwrap();

    let mut cmd = Command::cargo_bin("lorabatch").unwrap();
    cmd.arg("--env-file")
        .arg(&env_file)
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("output_suffix"));
}

#[test]
fn test_empty_batch_reports_exclusions_as_json() {
    let temp = TempDir::new().unwrap();
    let env_file = setup(&temp, "/bin/false");
    std::fs::create_dir_all(temp.path().join("training/.ipynb_checkpoints")).unwrap();
    std::fs::write(temp.path().join("training/readme.txt"), "x").unwrap();

    let mut cmd = Command::cargo_bin("lorabatch").unwrap();
    cmd.arg("--env-file")
        .arg(&env_file)
        .args(["run", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"processed\": []"))
        .stdout(predicate::str::contains("readme.txt"))
        .stdout(predicate::str::contains(".ipynb_checkpoints"));
}

#[cfg(unix)]
#[test]
fn test_failed_training_leaves_unit_in_place() {
    let temp = TempDir::new().unwrap();
    let accelerate = temp.path().join("fake-accelerate");
    write_script(&accelerate, "echo 'ValueError: no images found' >&2\nexit 1");
    let env_file = setup(&temp, &accelerate.display().to_string());
    std::fs::create_dir_all(temp.path().join("training/catA")).unwrap();

    let mut cmd = Command::cargo_bin("lorabatch").unwrap();
    cmd.arg("--env-file")
        .arg(&env_file)
        .args(["run", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"remaining\": [\n    \"catA\"\n  ]"));

    assert!(temp.path().join("training/catA").is_dir());
    assert!(!temp.path().join("tmp/catA_v1.toml").exists());
    assert!(temp.path().join("models/base.safetensors").is_file());
    assert!(!temp.path().join("tmp/base.safetensors").exists());
}

#[test]
fn test_add_document_changes_suffix_and_merges() {
    let temp = TempDir::new().unwrap();
    let env_file = setup(&temp, "/bin/false");
    std::fs::write(temp.path().join("program/style.toml"), "max_train_epochs = 20\n").unwrap();

    let mut cmd = Command::cargo_bin("lorabatch").unwrap();
    cmd.arg("--env-file")
        .arg(&env_file)
        .args(["run", "--add", "style.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("v1-style"))
        .stdout(predicate::str::contains("[changed] max_train_epochs: 10 -> 20"));
}

#[test]
fn test_check_remote_prints_reconnect_hint() {
    let temp = TempDir::new().unwrap();
    let env_file = setup(&temp, "/bin/false");

    let mut cmd = Command::cargo_bin("lorabatch").unwrap();
    cmd.arg("--env-file")
        .arg(&env_file)
        .arg("check-remote")
        .assert()
        .failure()
        .stdout(predicate::str::contains("config reconnect google:"));
}

#[test]
fn test_download_model_requires_model_list() {
    let temp = TempDir::new().unwrap();
    let env_file = setup(&temp, "/bin/false");

    let mut cmd = Command::cargo_bin("lorabatch").unwrap();
    cmd.arg("--env-file")
        .arg(&env_file)
        .arg("download-model")
        .assert()
        .failure()
        .stderr(predicate::str::contains("[modeldownload].models"));
}

#[test]
fn test_download_model_requires_file_name() {
    let temp = TempDir::new().unwrap();
    let env_file = temp.path().join("env.toml");
    std::fs::write(&env_file, "[modeldownload]\nmodels = [{ repo_id = \"org/sdxl\" }]\n").unwrap();

    let mut cmd = Command::cargo_bin("lorabatch").unwrap();
    cmd.arg("--env-file")
        .arg(&env_file)
        .arg("download-model")
        .assert()
        .failure()
        .stderr(predicate::str::contains("pretrained_model_name_or_path"));
}
