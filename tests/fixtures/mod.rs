//! Shared test fixtures: temp directories, collecting listeners, and raw
//! on-disk crafting of peer state.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use decsync::{Datetime, Decsync, Entry};

/// What collecting listeners record: (path, entry) in delivery order.
pub type Log = Vec<(Vec<String>, Entry)>;

pub fn path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

pub fn dt(s: &str) -> Datetime {
    Datetime::new(s)
}

pub fn entry(datetime: &str, key: &str, value: Value) -> Entry {
    Entry::new(dt(datetime), json!(key), value)
}

/// One shared DecSync directory plus per-app local directories.
pub struct TestDir {
    root: tempfile::TempDir,
}

impl TestDir {
    pub fn new() -> Self {
        init_tracing();
        Self {
            root: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn decsync_dir(&self) -> PathBuf {
        self.root.path().join("decsync")
    }

    /// Subtree root for the fixture's sync type.
    pub fn sub(&self) -> PathBuf {
        self.decsync_dir().join("contacts")
    }

    pub fn local_dir(&self, app_id: &str) -> PathBuf {
        let dir = self.root.path().join("local").join(app_id);
        fs::create_dir_all(&dir).expect("local dir");
        dir
    }

    pub fn open(&self, app_id: &str) -> Decsync<Log> {
        Decsync::new(self.decsync_dir(), self.local_dir(app_id), "contacts", None, app_id)
            .expect("open decsync")
    }

    pub fn write_root_info(&self, contents: &str) {
        fs::create_dir_all(self.decsync_dir()).expect("decsync dir");
        fs::write(self.decsync_dir().join(".decsync-info"), contents).expect("root info");
    }

    pub fn read_root_info(&self) -> Value {
        let bytes = fs::read(self.decsync_dir().join(".decsync-info")).expect("root info");
        serde_json::from_slice(&bytes).expect("root info json")
    }

    /// Craft a V1 writer's log file for one path, as a peer process would.
    pub fn write_v1_new_entries(&self, app_id: &str, p: &[&str], entries: &[Entry]) {
        let file = self
            .sub()
            .join("new-entries")
            .join(app_id)
            .join(encode_path(p));
        write_lines(&file, entries);
    }

    /// Craft a V1 writer's merged snapshot for one path.
    pub fn write_v1_stored_entries(&self, app_id: &str, p: &[&str], entries: &[Entry]) {
        let file = self
            .sub()
            .join("stored-entries")
            .join(app_id)
            .join(encode_path(p));
        write_lines(&file, entries);
    }

    /// Craft a V2 writer's merged snapshot for one path.
    pub fn write_v2_stored_entries(&self, app_id: &str, p: &[&str], entries: &[Entry]) {
        let file = self
            .sub()
            .join("v2")
            .join(app_id)
            .join("stored-entries")
            .join(encode_path(p));
        write_lines(&file, entries);
    }

    /// Craft a V2 writer's log shard.
    pub fn write_v2_log(&self, app_id: &str, p: &[&str], entries: &[Entry]) {
        let file = self
            .sub()
            .join("v2")
            .join(app_id)
            .join("entries")
            .join("0");
        let mut contents = String::new();
        for entry in entries {
            let line = serde_json::to_string(&json!([
                p,
                entry.datetime.as_str(),
                entry.key.clone(),
                entry.value.clone()
            ]))
            .unwrap();
            contents.push_str(&line);
            contents.push('\n');
        }
        fs::create_dir_all(file.parent().unwrap()).expect("log dir");
        let mut existing = fs::read_to_string(&file).unwrap_or_default();
        existing.push_str(&contents);
        fs::write(&file, existing).expect("log shard");
    }
}

/// The locked wire encoding: lowercase hex per segment, joined with `-`.
pub fn encode_path(p: &[&str]) -> String {
    p.iter()
        .map(|segment| {
            segment
                .as_bytes()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn write_lines(file: &Path, entries: &[Entry]) {
    fs::create_dir_all(file.parent().unwrap()).expect("entry dir");
    let mut contents = String::new();
    for entry in entries {
        let line = serde_json::to_string(&json!([
            entry.datetime.as_str(),
            entry.key.clone(),
            entry.value.clone()
        ]))
        .unwrap();
        contents.push_str(&line);
        contents.push('\n');
    }
    fs::write(file, contents).expect("entry file");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Register a listener on everything that records deliveries into the log.
pub fn add_collector(decsync: &mut Decsync<Log>) {
    decsync.add_listener(&[], |p: &[String], e: &Entry, log: &mut Log| {
        log.push((p.to_vec(), e.clone()));
    });
}

/// The merged view under `prefix` as (path, key-text, value-text) triples.
///
/// Replays stored entries through the registered listeners, so the instance
/// needs [`add_collector`] (or an equivalent catch-all) in place.
pub fn merged_view(
    decsync: &mut Decsync<Log>,
    prefix: &[String],
) -> Vec<(Vec<String>, String, String)> {
    let mut log: Log = Vec::new();
    decsync
        .execute_stored_entries_for_path_prefix(prefix, &mut log, None)
        .expect("replay stored entries");
    let mut view: Vec<(Vec<String>, String, String)> = log
        .into_iter()
        .map(|(p, e)| (p, e.key.to_string(), e.value.to_string()))
        .collect();
    view.sort();
    view
}
