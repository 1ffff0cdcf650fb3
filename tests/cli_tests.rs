//! Integration tests for strixctl: config layering and the maintenance commands.

use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

use strix::{Appender, Db};

mod common;
use common::{ls, test_config, write_block};

/// Run strixctl in a subprocess with the given args and env. Returns (success, stdout, stderr).
fn run_strixctl(args: &[&str], env_extra: &[(&str, &str)]) -> (bool, String, String) {
    let exe = env!("CARGO_BIN_EXE_strixctl");
    let mut cmd = Command::new(exe);
    cmd.args(args);
    cmd.env_remove("STRIX_DATA_DIR").env_remove("STRIX_CONFIG");
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    let out = cmd.output().expect("run strixctl");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out.status.success(), stdout, stderr)
}

fn small_ranges() -> [(&'static str, &'static str); 1] {
    [("STRIX_BLOCK_RANGES", "100,300,900")]
}

#[test]
fn validate_config_no_config_uses_defaults() {
    let (ok, stdout, stderr) = run_strixctl(&["--no-config", "validate-config"], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("data_dir=data"), "stdout: {}", stdout);
    assert!(stdout.contains("block_ranges=7200000,36000000,180000000"), "stdout: {}", stdout);
}

#[test]
fn validate_config_env_overridden_by_cli() {
    let (ok, stdout, _) = run_strixctl(
        &["--no-config", "--data-dir", "/cli/dir", "validate-config"],
        &[("STRIX_DATA_DIR", "/env/dir"), ("STRIX_RETENTION_MS", "1000")],
    );
    assert!(ok);
    assert!(stdout.contains("data_dir=/cli/dir"), "CLI should win: {}", stdout);
    assert!(stdout.contains("retention_ms=1000"), "stdout: {}", stdout);
}

#[test]
fn validate_config_reads_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("strix.toml");
    std::fs::write(&path, "data_dir = \"/from/file\"\nblock_ranges = [10, 30]\nwal_sync = false\n").unwrap();

    let (ok, stdout, stderr) = run_strixctl(&["--config", path.to_str().unwrap(), "validate-config"], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("data_dir=/from/file"), "stdout: {}", stdout);
    assert!(stdout.contains("block_ranges=10,30"), "stdout: {}", stdout);
    assert!(stdout.contains("wal_sync=false"), "stdout: {}", stdout);
}

#[test]
fn invalid_block_ranges_fail() {
    let (ok, _, stderr) = run_strixctl(
        &["--no-config", "validate-config"],
        &[("STRIX_BLOCK_RANGES", "300,100")],
    );
    assert!(!ok);
    assert!(stderr.contains("config error"), "stderr: {}", stderr);
}

#[test]
fn missing_config_file_fails() {
    let (ok, _, stderr) = run_strixctl(&["--config", "/nonexistent/strix.toml", "validate-config"], &[]);
    assert!(!ok);
    assert!(stderr.contains("config file not found"), "stderr: {}", stderr);
}

fn populate(dir: &Path) {
    write_block(dir, &[(ls(&[("job", "api")]), vec![(1, 1.0), (2, 2.0)])], 0, 100);
    let db = Db::open(dir, test_config()).unwrap();
    let mut app = db.appender();
    app.add(&ls(&[("job", "api")]), 150, 3.0).unwrap();
    app.add(&ls(&[("job", "db")]), 150, 4.0).unwrap();
    app.commit().unwrap();
    db.close().unwrap();
}

#[test]
fn ls_and_query_read_the_data_dir() {
    let dir = tempdir().unwrap();
    populate(dir.path());
    let data_dir = dir.path().to_str().unwrap();

    let (ok, stdout, stderr) = run_strixctl(&["--no-config", "--data-dir", data_dir, "ls"], &small_ranges());
    assert!(ok, "stderr: {}", stderr);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "stdout: {}", stdout);
    assert!(lines[0].starts_with("ULID"));

    let (ok, stdout, stderr) = run_strixctl(
        &["--no-config", "--data-dir", data_dir, "query", "job=api", "--min-time", "0"],
        &small_ranges(),
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("{job=\"api\"}"), "stdout: {}", stdout);
    assert!(stdout.contains("  1 1"), "stdout: {}", stdout);
    assert!(stdout.contains("  150 3"), "stdout: {}", stdout);
    assert!(!stdout.contains("db"), "stdout: {}", stdout);

    let (ok, _, stderr) = run_strixctl(
        &["--no-config", "--data-dir", data_dir, "query", "job"],
        &small_ranges(),
    );
    assert!(!ok);
    assert!(stderr.contains("cannot parse matcher"), "stderr: {}", stderr);
}

#[test]
fn snapshot_command_writes_blocks() {
    let dir = tempdir().unwrap();
    let out = tempdir().unwrap();
    populate(dir.path());
    let target = out.path().join("snap");

    let (ok, _, stderr) = run_strixctl(
        &[
            "--no-config",
            "--data-dir",
            dir.path().to_str().unwrap(),
            "snapshot",
            target.to_str().unwrap(),
            "--with-head",
        ],
        &small_ranges(),
    );
    assert!(ok, "stderr: {}", stderr);
    assert_eq!(strix::block::block_dirs(&target).unwrap().len(), 2);
}

#[test]
fn compact_command_persists_the_head() {
    let dir = tempdir().unwrap();
    {
        let db = Db::open(dir.path(), test_config()).unwrap();
        db.set_compactions_enabled(false);
        let mut app = db.appender();
        for t in 0..200 {
            app.add(&ls(&[("a", "b")]), t, 1.0).unwrap();
        }
        app.commit().unwrap();
        db.close().unwrap();
    }

    let (ok, _, stderr) = run_strixctl(
        &["--no-config", "--data-dir", dir.path().to_str().unwrap(), "compact"],
        &small_ranges(),
    );
    assert!(ok, "stderr: {}", stderr);
    assert_eq!(strix::block::block_dirs(dir.path()).unwrap().len(), 1);
}
