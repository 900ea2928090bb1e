#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use redoline::admin::{self, open_data_dir, AdminOpenOptions, SpaceSpec, LOG_FILE_NAME};
use redoline::buffer::BufferPool;
use redoline::checkpoint::find_checkpoint;
use redoline::log::{Mtr, RedoLog};
use redoline::storage::PageStorage;
use redoline::types::PageId;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    data: PathBuf,
    config: PathBuf,
}

fn setup(pages: u32) -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let data = dir.path().join("data");
    // an empty config keeps the user's config file out of the run
    let config = dir.path().join("config.toml");
    fs::write(&config, "").expect("write config");
    seed_crashed(&data, pages).expect("seed data dir");
    Fixture {
        _dir: dir,
        data,
        config,
    }
}

/// Commits one mini-transaction per page and stops without flushing any page.
fn seed_crashed(dir: &Path, pages: u32) -> admin::Result<()> {
    let opts = AdminOpenOptions::default();
    admin::init(
        dir,
        &opts,
        &[SpaceSpec {
            space: 1,
            name: "one.ibd".into(),
        }],
    )?;
    let data = open_data_dir(dir, &opts, false)?;
    data.storage.extend(1, pages + 1)?;
    let checkpoint = find_checkpoint(&data.log)?;
    let end = data.log.end_lsn()?;
    let redo = Arc::new(RedoLog::open(
        Arc::clone(&data.log),
        end,
        checkpoint,
        opts.log.clone(),
    )?);
    let pool = BufferPool::new(data.storage.clone(), None, opts.pool.clone())?;
    pool.set_redo_log(redo.clone());
    let mut last = end;
    for no in 1..=pages {
        let id = PageId::new(1, no);
        let mut mtr = Mtr::new();
        mtr.init_page(id).write(id, 120, format!("page-{no}").as_bytes());
        last = mtr.commit(&redo, &pool)?.end;
    }
    redo.flush_up_to(last)?;
    Ok(())
}

fn run_json(fixture: &Fixture, args: &[&str]) -> (i32, Value) {
    let output = cargo_bin_cmd!("redoline")
        .arg("--config")
        .arg(&fixture.config)
        .args(["--format", "json"])
        .args(args)
        .arg(&fixture.data)
        .output()
        .expect("run redoline");
    let code = output.status.code().expect("exit code");
    let value = serde_json::from_slice(&output.stdout).unwrap_or(Value::Null);
    (code, value)
}

#[test]
fn recover_replays_and_reports_consistent() {
    let fixture = setup(5);
    let (code, json) = run_json(&fixture, &["recover"]);
    assert_eq!(code, 0, "output: {json}");
    let report = &json["Consistent"];
    assert_eq!(report["apply"]["pages_recovered"].as_u64(), Some(5));
    assert_eq!(report["log_truncated"].as_bool(), Some(false));
    assert!(report["failures"].as_array().expect("failures").is_empty());
    assert!(report["new_checkpoint"].is_object());

    // the new checkpoint covers everything, so a second run has nothing to do
    let (code, json) = run_json(&fixture, &["recover"]);
    assert_eq!(code, 0);
    assert_eq!(json["Consistent"]["apply"]["pages_recovered"].as_u64(), Some(0));
}

#[test]
fn read_only_recover_leaves_the_log_alone() {
    let fixture = setup(3);
    let log_path = fixture.data.join(LOG_FILE_NAME);
    let before = fs::read(&log_path).expect("read log");
    let (code, json) = run_json(&fixture, &["recover", "--read-only"]);
    assert_eq!(code, 0, "output: {json}");
    assert_eq!(json["Consistent"]["apply"]["pages_recovered"].as_u64(), Some(3));
    assert!(json["Consistent"]["new_checkpoint"].is_null());
    assert_eq!(fs::read(&log_path).expect("read log"), before);
}

#[test]
fn pending_lists_every_touched_page() {
    let fixture = setup(4);
    let (code, json) = run_json(&fixture, &["pending"]);
    assert_eq!(code, 0);
    let pages = json["pages"].as_array().expect("pages");
    assert_eq!(pages.len(), 4);
    // init + write per page
    assert_eq!(json["total_records"].as_u64(), Some(8));
    assert!(pages.iter().all(|p| p["records"].as_u64() == Some(2)));
}

#[test]
fn checkpoint_shows_the_selected_slot() {
    let fixture = setup(2);
    let (code, json) = run_json(&fixture, &["checkpoint"]);
    assert_eq!(code, 0);
    assert_eq!(json["slots"].as_array().expect("slots").len(), 2);
    assert_eq!(json["selected"]["checkpoint_no"].as_u64(), Some(1));
    assert!(json["checkpoint_age"].as_u64().expect("age") > 0);
}

#[test]
fn damaged_checkpoint_is_fatal() {
    let fixture = setup(2);
    let log_path = fixture.data.join(LOG_FILE_NAME);
    let mut bytes = fs::read(&log_path).expect("read log");
    // the only valid checkpoint lives in slot 1
    bytes[1536 + 9] ^= 0xFF;
    fs::write(&log_path, bytes).expect("write log");
    let (code, json) = run_json(&fixture, &["recover"]);
    assert_eq!(code, 1);
    assert!(json["Fatal"]["error"].is_string());
}

#[test]
fn missing_data_dir_fails() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("config.toml");
    fs::write(&config, "").expect("write config");
    cargo_bin_cmd!("redoline")
        .arg("--config")
        .arg(&config)
        .arg("recover")
        .arg(dir.path().join("absent"))
        .assert()
        .code(1);
}

#[test]
fn init_creates_a_recoverable_directory() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("config.toml");
    fs::write(&config, "").expect("write config");
    let data = dir.path().join("fresh");
    let output = cargo_bin_cmd!("redoline")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "init", "--space", "3:three.ibd"])
        .arg(&data)
        .output()
        .expect("run init");
    assert!(output.status.success());
    let json: Value = serde_json::from_slice(&output.stdout).expect("init json");
    assert_eq!(json["spaces"][0]["name"].as_str(), Some("three.ibd"));
    assert!(data.join(LOG_FILE_NAME).is_file());

    let fixture = Fixture {
        _dir: dir,
        data,
        config,
    };
    let (code, json) = run_json(&fixture, &["recover"]);
    assert_eq!(code, 0, "output: {json}");
    // FILE_CREATE was logged after the checkpoint
    assert_eq!(json["Consistent"]["file_ops"].as_u64(), Some(1));
}
