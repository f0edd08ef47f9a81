//! CLI contract tests for `redis-list-buffer`.
//!
//! Contract guarantees tested:
//! - Startup failures exit 1 with an actionable message
//! - `status` never needs a broker and reports the on-disk backlog
//! - `status --json` emits a stable, parseable document

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Fixture helpers
// =============================================================================

fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let path = dir.join("buffer.yaml");
    let contents = format!(
        "index_file: {index}\n\
         data_dir: {data}\n\
         tick: 100\n\
         target_in: 1000\n\
         target_out: 1000\n\
         redis_chunk: 100\n\
         data_chunk: 10000\n\
         {extra}",
        index = dir.join("index.db").display(),
        data = dir.join("data").display(),
    );
    std::fs::write(&path, contents).expect("write config");
    path
}

fn bin() -> Command {
    let mut cmd = Command::cargo_bin("redis-list-buffer").expect("binary built");
    cmd.env_remove("RUST_LOG");
    cmd
}

// =============================================================================
// Help and argument parsing
// =============================================================================

#[test]
fn help_lists_subcommands() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn missing_subcommand_is_usage_error() {
    bin().assert().failure().code(2);
}

#[test]
fn unknown_log_level_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    bin()
        .args(["--log-level", "loud", "status"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown log level"));
}

// =============================================================================
// Startup failures
// =============================================================================

#[test]
fn run_with_missing_config_exits_1() {
    let dir = TempDir::new().unwrap();
    bin()
        .arg("run")
        .arg(dir.path().join("absent.yaml"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn run_rejects_out_of_range_db() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "redis:\n  db: 16\n");
    bin()
        .arg("run")
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid db number"));
}

#[test]
fn run_with_unreachable_broker_exits_1() {
    let dir = TempDir::new().unwrap();
    // Port 1 on loopback is reserved and refuses connections.
    let config = write_config(
        dir.path(),
        "redis:\n  host: 127.0.0.1:1\n  timeout_ms: 500\n",
    );
    bin()
        .arg("run")
        .arg(&config)
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("broker"));
    assert!(
        !dir.path().join("data").exists(),
        "storage must not be created before the broker is reachable"
    );
}

#[test]
fn status_with_malformed_config_exits_1() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.yaml");
    std::fs::write(&path, "tick: [not a number\n").unwrap();
    bin()
        .arg("status")
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Parse error"));
}

// =============================================================================
// status
// =============================================================================

#[test]
fn status_on_fresh_workspace_reports_no_chunks() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    bin()
        .arg("status")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Chunks:   0"))
        .stdout(predicate::str::contains("consistent with index"));
    assert!(
        !dir.path().join("index.db").exists(),
        "status must not create the index"
    );
}

#[test]
fn status_json_reports_backlog() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    {
        let store_config = listbuffer_core::chunk_store::ChunkStoreConfig {
            data_dir: dir.path().join("data"),
            index_file: dir.path().join("index.db"),
            data_chunk: 2,
        };
        let mut store =
            listbuffer_core::chunk_store::ChunkStore::open(&store_config).unwrap();
        let items = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        store.write(&items).unwrap();
        store.close().unwrap();
    }

    let output = bin()
        .args(["status", "--json"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["chunks"], 2);
    assert_eq!(json["items"], 3);
    assert_eq!(json["oldest_chunk"], "0000000000000001");
    assert_eq!(json["newest_chunk"], "0000000000000002");
    assert_eq!(json["consistent"], true);
    assert_eq!(json["records"].as_array().unwrap().len(), 2);
}

#[test]
fn status_flags_untracked_chunk_files() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("00000000000000ff.txt"), "stray\n").unwrap();

    bin()
        .arg("status")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Untracked chunk file"))
        .stdout(predicate::str::contains("00000000000000ff.txt"));
}
