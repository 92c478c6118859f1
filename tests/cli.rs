//! CLI tests that exercise the compiled `gharvest` binary.
//!
//! Network-dependent paths point at a closed local port so every test runs
//! offline and fails fast.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn gharvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("gharvest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/gharvest.sqlite"

[archive]
base_url = "http://127.0.0.1:1"
work_dir = "{root}/incoming"

[downloader]
max_concurrent = 2
max_attempts = 1
base_backoff_ms = 1
max_backoff_ms = 2
request_timeout_secs = 2
"#,
        root = root.display()
    );

    let config_path = config_dir.join("gharvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_gharvest(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = gharvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run gharvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_gharvest(&config_path, &["init"]);
    assert_eq!(code, Some(0), "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/gharvest.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, code1) = run_gharvest(&config_path, &["init"]);
    assert_eq!(code1, Some(0), "First init failed");

    let (_, _, code2) = run_gharvest(&config_path, &["init"]);
    assert_eq!(code2, Some(0), "Second init failed (not idempotent)");
}

#[test]
fn test_stats_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();

    run_gharvest(&config_path, &["init"]);
    let (stdout, stderr, code) = run_gharvest(&config_path, &["stats"]);
    assert_eq!(code, Some(0), "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Database Stats"));
    assert!(stdout.contains("Events:       0"));
    assert!(stdout.contains("Open gaps:    0"));
}

#[test]
fn test_discover_is_offline_safe() {
    let (tmp, config_path) = setup_test_env();

    run_gharvest(&config_path, &["init"]);
    let (stdout, stderr, code) = run_gharvest(&config_path, &["run", "--mode", "discover"]);
    assert_eq!(
        code,
        Some(0),
        "discover failed: stdout={}, stderr={}",
        stdout,
        stderr
    );
    assert!(stdout.contains("Archive discovery"));
    assert!(stdout.contains("would be fetched"));
    // Discovery never downloads or spools anything.
    let spooled = fs::read_dir(tmp.path().join("incoming"))
        .map(|d| d.count())
        .unwrap_or(0);
    assert_eq!(spooled, 0);
}

#[test]
fn test_unreachable_mirror_exits_with_partial_failure_code() {
    let (_tmp, config_path) = setup_test_env();

    run_gharvest(&config_path, &["init"]);
    let (stdout, _stderr, code) = run_gharvest(
        &config_path,
        &["run", "--mode", "single-date", "--date", "2024-01-15"],
    );
    assert_eq!(code, Some(2), "expected partial-failure exit: {}", stdout);
    assert!(stdout.contains("24 failed"));
}

#[test]
fn test_single_date_requires_date() {
    let (_tmp, config_path) = setup_test_env();

    run_gharvest(&config_path, &["init"]);
    let (_stdout, stderr, code) = run_gharvest(&config_path, &["run", "--mode", "single-date"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("--date"));
}

#[test]
fn test_range_rejects_inverted_dates() {
    let (_tmp, config_path) = setup_test_env();

    run_gharvest(&config_path, &["init"]);
    let (_stdout, stderr, code) = run_gharvest(
        &config_path,
        &[
            "run",
            "--mode",
            "range",
            "--start-date",
            "2024-01-15",
            "--end-date",
            "2024-01-10",
        ],
    );
    assert_eq!(code, Some(1));
    assert!(stderr.contains("--end-date"));
}

#[test]
fn test_missing_config_is_a_clear_error() {
    let tmp = TempDir::new().unwrap();
    let bogus = tmp.path().join("nope.toml");
    let (_stdout, stderr, code) = run_gharvest(&bogus, &["stats"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("config"));
}
