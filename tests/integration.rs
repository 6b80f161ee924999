use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dwatch_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("dwatch");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/dwatch.sqlite"

[server]
bind = "127.0.0.1:7341"

[blob]
root = "{}/data/blobs"
"#,
        root.display(),
        root.display()
    );

    let config_path = config_dir.join("dwatch.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_dwatch(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dwatch_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dwatch binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_dwatch(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/dwatch.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, first) = run_dwatch(&config_path, &["init"]);
    let (_, stderr, second) = run_dwatch(&config_path, &["init"]);
    assert!(first);
    assert!(second, "second init failed: {}", stderr);
}

#[test]
fn test_channels_list_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_dwatch(&config_path, &["init"]);
    let (stdout, stderr, success) = run_dwatch(&config_path, &["channels", "list"]);
    assert!(success, "channels list failed: {}", stderr);
    assert!(stdout.contains("No channels registered"));
}

#[test]
fn test_queues_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_dwatch(&config_path, &["init"]);
    let (stdout, stderr, success) = run_dwatch(&config_path, &["queues"]);
    assert!(success, "queues failed: {}", stderr);
    assert!(stdout.contains("notifications"));
    assert!(stdout.contains("pipeline"));
}

#[test]
fn test_sweep_with_no_channels() {
    let (_tmp, config_path) = setup_test_env();
    run_dwatch(&config_path, &["init"]);
    let (stdout, stderr, success) = run_dwatch(&config_path, &["sweep"]);
    assert!(success, "sweep failed: {}", stderr);
    assert!(stdout.contains("Enqueued 0"));
}

#[test]
fn test_stages_show_unknown_document_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_dwatch(&config_path, &["init"]);
    let (_, stderr, success) = run_dwatch(&config_path, &["stages", "show", "nope"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("absent.toml");
    let (_, _, success) = run_dwatch(&missing, &["init"]);
    assert!(!success);
}

#[test]
fn test_stages_unstarted_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_dwatch(&config_path, &["init"]);
    let (stdout, stderr, success) = run_dwatch(&config_path, &["stages", "unstarted"]);
    assert!(success, "stages unstarted failed: {}", stderr);
    assert!(stdout.contains("No unstarted documents"));
}

#[test]
fn test_stages_stale_rejects_out_of_range_age() {
    let (_tmp, config_path) = setup_test_env();
    run_dwatch(&config_path, &["init"]);
    let (_, stderr, success) = run_dwatch(
        &config_path,
        &["stages", "stale", "--older-than-secs", "9223372036854775807"],
    );
    assert!(!success);
    assert!(stderr.contains("older-than-secs"));
}
