use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, SystemTime};

use assert_cmd::prelude::*;
use filetime::FileTime;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use arena_core::store::{load_source_at, save_source_at, source_path_at};
use arena_core::types::{
    ArenaTemplateSource, ConfigStoreSource, ObjectMeta, Phase, SourceKey, SourceType,
    TemplateSourceSpec, TemplateSourceStatus,
};

fn arena_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("arena"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("RUST_LOG", "warn");
    cmd
}

fn save_config_store_source(home: &Path, namespace: &str, name: &str) {
    let source = ArenaTemplateSource {
        metadata: ObjectMeta {
            name: name.into(),
            namespace: namespace.into(),
            workspace: Some("acme".to_string()),
            generation: 1,
        },
        spec: TemplateSourceSpec {
            source_type: SourceType::ConfigStore,
            config_store: Some(ConfigStoreSource {
                name: name.to_string(),
                key_prefix: None,
            }),
            ..TemplateSourceSpec::default()
        },
        status: TemplateSourceStatus::default(),
    };
    save_source_at(home, &source).expect("save source");
}

fn write_config_store(home: &Path, namespace: &str, name: &str) {
    let path = home
        .join(".arena/configstores")
        .join(namespace)
        .join(format!("{name}.yaml"));
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(
        path,
        "data:\n  support/template.yaml: |\n    name: support\n    category: chat\n  support/prompt.md: Be kind.\n",
    )
    .expect("write config store");
}

fn make_versions(root: &Path, names: &[&str]) {
    let base = SystemTime::now() - Duration::from_secs(3600);
    for (i, name) in names.iter().enumerate() {
        let dir = root.join(".arena/versions").join(name);
        fs::create_dir_all(&dir).expect("version dir");
        let mtime = FileTime::from_system_time(base + Duration::from_secs(60 * i as u64));
        filetime::set_file_mtime(&dir, mtime).expect("set mtime");
    }
}

// ---------------------------------------------------------------------------
// gc
// ---------------------------------------------------------------------------

#[test]
fn gc_keeps_the_newest_versions() {
    let home = TempDir::new().expect("home");
    let target = TempDir::new().expect("target");
    make_versions(
        target.path(),
        &["aaaaaaaaaaa1", "aaaaaaaaaaa2", "aaaaaaaaaaa3", "aaaaaaaaaaa4", "aaaaaaaaaaa5"],
    );

    arena_cmd(home.path())
        .args(["gc"])
        .arg(target.path())
        .args(["--max-versions", "3"])
        .assert()
        .success()
        .stdout(contains("removed 2 version(s)"))
        .stdout(contains("aaaaaaaaaaa1"))
        .stdout(contains("aaaaaaaaaaa2"));

    let versions = target.path().join(".arena/versions");
    assert!(!versions.join("aaaaaaaaaaa1").exists());
    assert!(!versions.join("aaaaaaaaaaa2").exists());
    for kept in ["aaaaaaaaaaa3", "aaaaaaaaaaa4", "aaaaaaaaaaa5"] {
        assert!(versions.join(kept).is_dir(), "{kept} should be retained");
    }
}

#[test]
fn gc_without_versions_is_a_no_op() {
    let home = TempDir::new().expect("home");
    let target = TempDir::new().expect("target");

    arena_cmd(home.path())
        .arg("gc")
        .arg(target.path())
        .assert()
        .success()
        .stdout(contains("nothing to collect"));
}

// ---------------------------------------------------------------------------
// source / status
// ---------------------------------------------------------------------------

#[test]
fn source_list_reports_empty_home() {
    let home = TempDir::new().expect("home");
    arena_cmd(home.path())
        .args(["source", "list"])
        .assert()
        .success()
        .stdout(contains("No template sources found."));
}

#[test]
fn source_list_json_describes_each_source() {
    let home = TempDir::new().expect("home");
    save_config_store_source(home.path(), "team-a", "support");

    let output = arena_cmd(home.path())
        .args(["source", "list", "--json"])
        .output()
        .expect("run arena");
    assert!(output.status.success());

    let sources: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let sources = sources.as_array().expect("array");
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0]["source"], "team-a/support");
    assert_eq!(sources[0]["type"], "configstore");
    assert_eq!(sources[0]["workspace"], "acme");
    assert_eq!(sources[0]["target_path"], "templates/support");
    assert_eq!(sources[0]["phase"], "Pending");
    assert_eq!(sources[0]["ready"], false);
}

#[test]
fn reconcile_rejects_malformed_and_unknown_sources() {
    let home = TempDir::new().expect("home");

    arena_cmd(home.path())
        .args(["reconcile", "no-slash"])
        .assert()
        .failure()
        .stderr(contains("invalid source"));

    arena_cmd(home.path())
        .args(["reconcile", "team-a/ghost"])
        .assert()
        .failure()
        .stderr(contains("not found"));
}

#[test]
fn reconcile_stores_and_indexes_a_config_store() {
    let home = TempDir::new().expect("home");
    save_config_store_source(home.path(), "team-a", "support");
    write_config_store(home.path(), "team-a", "support");

    arena_cmd(home.path())
        .args(["reconcile", "team-a/support"])
        .assert()
        .success()
        .stdout(contains("Ready"))
        .stdout(contains("support"));

    let key = SourceKey::new("team-a", "support");
    let source = load_source_at(home.path(), &key)
        .expect("load")
        .expect("source");
    assert_eq!(source.status.phase, Some(Phase::Ready));
    let version = source.status.head_version.expect("head version");

    let target = home
        .path()
        .join(".arena/workspaces/acme/team-a/templates/support");
    assert_eq!(
        fs::read_to_string(target.join(".arena/HEAD")).expect("HEAD"),
        version
    );
    assert!(target
        .join(".arena/versions")
        .join(&version)
        .join("support/prompt.md")
        .is_file());

    let index = home
        .path()
        .join(".arena/workspaces/acme/team-a/template-index/support.json");
    let templates: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(index).expect("index")).expect("index json");
    assert_eq!(templates[0]["name"], "support");
    assert_eq!(templates[0]["category"], "chat");

    let status = arena_cmd(home.path())
        .args(["status", "--json"])
        .output()
        .expect("run status");
    let status: serde_json::Value = serde_json::from_slice(&status.stdout).expect("status json");
    assert_eq!(status["summary"]["ready"], 1);
    assert_eq!(status["sources"][0]["head_version"], version.as_str());
}

#[test]
fn reconcile_reports_fetch_failures() {
    let home = TempDir::new().expect("home");
    save_config_store_source(home.path(), "team-a", "support");

    arena_cmd(home.path())
        .args(["reconcile", "team-a/support"])
        .assert()
        .failure()
        .stderr(contains("FetchFailed"));
}

#[test]
fn delete_with_purge_removes_versions_and_index() {
    let home = TempDir::new().expect("home");
    save_config_store_source(home.path(), "team-a", "support");
    write_config_store(home.path(), "team-a", "support");
    arena_cmd(home.path())
        .args(["reconcile", "team-a/support"])
        .assert()
        .success();

    let workspace = home.path().join(".arena/workspaces/acme/team-a");
    assert!(workspace.join("templates/support/.arena").is_dir());

    arena_cmd(home.path())
        .args(["source", "delete", "team-a/support", "--purge"])
        .assert()
        .success()
        .stdout(contains("Deleted source 'team-a/support'"))
        .stdout(contains("removed template index"));

    let key = SourceKey::new("team-a", "support");
    assert!(!source_path_at(home.path(), &key).exists());
    assert!(!workspace.join("templates/support/.arena").exists());
    assert!(!workspace.join("template-index/support.json").exists());
}

#[test]
fn delete_without_purge_keeps_content() {
    let home = TempDir::new().expect("home");
    save_config_store_source(home.path(), "team-a", "support");
    write_config_store(home.path(), "team-a", "support");
    arena_cmd(home.path())
        .args(["reconcile", "team-a/support"])
        .assert()
        .success();

    arena_cmd(home.path())
        .args(["source", "delete", "team-a/support"])
        .assert()
        .success()
        .stdout(contains("removed").not());

    assert!(home
        .path()
        .join(".arena/workspaces/acme/team-a/template-index/support.json")
        .is_file());
}

#[test]
fn status_and_daemon_status_without_daemon() {
    let home = TempDir::new().expect("home");

    arena_cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("0 sources"));

    arena_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));
}
