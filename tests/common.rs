#![allow(dead_code)]
use assert_cmd::{Command, cargo_bin_cmd};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// A `besideyou` command pointed at `data_dir`, with no passphrase leaking in
/// from the environment.
pub fn besideyou(data_dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("besideyou");
    cmd.arg("--data-dir")
        .arg(data_dir)
        .env_remove("BESIDEYOU_PASSPHRASE")
        .env_remove("RUST_LOG");
    cmd
}

pub fn state_file(data_dir: &Path) -> PathBuf {
    data_dir.join("state.json")
}

pub fn read_state(data_dir: &Path) -> Value {
    let raw = fs::read(state_file(data_dir)).expect("state file");
    serde_json::from_slice(&raw).expect("state json")
}

/// Ids of one collection, in stored order, as text.
pub fn ids(data_dir: &Path, collection: &str) -> Vec<String> {
    read_state(data_dir)[collection]
        .as_array()
        .map(|records| {
            records
                .iter()
                .map(|r| match &r["id"] {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn log_symptom(data_dir: &Path, name: &str) {
    besideyou(data_dir)
        .args(["symptom", name, "--severity", "6"])
        .assert()
        .success();
}
