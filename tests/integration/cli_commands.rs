#![allow(missing_docs)]
#![allow(clippy::field_reassign_with_default)]

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use stree::storage::{StoreConfig, TailPolicy};
use tempfile::TempDir;

fn json_output(args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("stree")
        .args(["--format", "json"])
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn simulate_verifies_every_file() {
    let json = json_output(&["--block-size", "1024", "simulate", "--files", "12", "--seed", "7"]);
    assert_eq!(json["files"], 12);
    assert_eq!(json["truncates"], 12);
    assert_eq!(json["pinned_after"], 0);
    assert!(json["mismatches"].as_array().expect("array").is_empty());
    assert!(json["tree"]["searches"].as_u64().unwrap_or(0) > 0);
    assert!(json["journal"]["ended"].as_u64().unwrap_or(0) > 0);
}

#[test]
fn simulate_with_deletes_and_small_checkpoints() {
    let json = json_output(&[
        "--block-size",
        "512",
        "--checkpoint-blocks",
        "2",
        "simulate",
        "--files",
        "20",
        "--max-blocks",
        "12",
        "--key-version",
        "v2",
        "--delete",
    ]);
    assert_eq!(json["deleted"], 10);
    assert!(json["mismatches"].as_array().expect("array").is_empty());
    assert_eq!(json["pinned_after"], 0);
}

#[test]
fn dump_lists_the_root_first() {
    let json = json_output(&["--block-size", "512", "dump", "--files", "30"]);
    let nodes = json.as_array().expect("node list");
    assert!(!nodes.is_empty());
    let root_level = nodes[0]["level"].as_u64().expect("level");
    assert!(nodes.iter().all(|node| node["level"].as_u64() <= Some(root_level)));
    assert!(nodes.iter().any(|node| node["level"] == 1));
}

#[test]
fn dump_of_one_block_is_hex() {
    let workload = ["--block-size", "256", "dump", "--files", "3", "--seed", "11"];
    let nodes = json_output(&workload);
    let root = nodes[0]["block"].as_u64().expect("root block").to_string();

    let mut args = workload.to_vec();
    args.extend(["--block", root.as_str()]);
    let json = json_output(&args);
    assert_eq!(json["block"].as_u64().map(|id| id.to_string()), Some(root));
    let rows = json["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 256 / 32);
    let first = rows[0].as_str().expect("row");
    assert!(first.starts_with("000000  "));
    assert_eq!(first.len(), 8 + 64);
}

#[test]
fn config_round_trips_through_a_file() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("stree.toml");
    let mut config = StoreConfig::default();
    config.block_size = 2048;
    config.tree.tail_policy = TailPolicy::Always;
    fs::write(&path, config.to_toml_string().expect("toml")).expect("write config");

    let output = cargo_bin_cmd!("stree")
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert_eq!(StoreConfig::from_toml_str(&text).expect("parse"), config);
}

#[test]
fn invalid_config_is_reported() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("broken.toml");
    fs::write(&path, "block_size = \"large\"\n").expect("write config");
    cargo_bin_cmd!("stree")
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure();
}
