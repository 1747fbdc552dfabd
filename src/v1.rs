//! V1 engine: per-path append logs plus per-path reader cursors.
//!
//! Layout under the subtree root:
//!
//! ```text
//! new-entries/<appId>/<path-encoded>    append-only [datetime, key, value] lines
//! stored-entries/<appId>/<path-encoded> that app's merged snapshot
//! read/<readerAppId>/<writerAppId>/<path-encoded>  reader's byte offset
//! ```
//!
//! Only the owning app appends under its appId; readers own their cursor
//! files. Cursor advancement is the last act per path and happens only when
//! the listener accepted the delivery.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{trace, warn};

use crate::Result;
use crate::codec;
use crate::entry::{Entry, EntryWithPath};
use crate::fs::SyncFs;
use crate::listener::{Listener, MetadataFilter, deliver};
use crate::stored::{self, complete_lines};

pub(crate) struct DecsyncV1 {
    fs: Arc<dyn SyncFs>,
    sub: PathBuf,
    own_app_id: String,
}

impl DecsyncV1 {
    pub fn new(fs: Arc<dyn SyncFs>, sub: PathBuf, own_app_id: String) -> Self {
        Self {
            fs,
            sub,
            own_app_id,
        }
    }

    fn new_entries_dir(&self, app_id: &str) -> PathBuf {
        self.sub.join("new-entries").join(app_id)
    }

    fn stored_dir(&self, app_id: &str) -> PathBuf {
        self.sub.join("stored-entries").join(app_id)
    }

    fn cursor_file(&self, writer: &str, encoded: &str) -> PathBuf {
        self.sub
            .join("read")
            .join(&self.own_app_id)
            .join(writer)
            .join(encoded)
    }

    fn writer_app_ids(&self) -> Result<Vec<String>> {
        self.fs.list_directories(&self.sub.join("new-entries"))
    }

    /// All apps that keep a merged snapshot, in ascending order.
    fn stored_app_ids(&self) -> Result<Vec<String>> {
        self.fs.list_directories(&self.sub.join("stored-entries"))
    }

    pub fn set_entries_for_path(&self, path: &[String], entries: &[Entry]) -> Result<()> {
        if path.is_empty() || entries.is_empty() {
            return Ok(());
        }
        let encoded = codec::encode_path(path);

        let mut lines = Vec::new();
        for entry in entries {
            lines.extend_from_slice(entry.to_line().as_bytes());
        }
        self.fs
            .append(&self.new_entries_dir(&self.own_app_id).join(&encoded), &lines)?;

        let file = self.stored_dir(&self.own_app_id).join(&encoded);
        let mut snapshot = stored::read_snapshot(&self.fs, &file)?;
        if stored::absorb_newer(&mut snapshot, entries.iter().cloned()) {
            stored::write_snapshot(&self.fs, &file, &snapshot)?;
        }
        Ok(())
    }

    pub fn set_entries(&self, entries: &[EntryWithPath]) -> Result<()> {
        for (path, group) in group_by_path(entries) {
            self.set_entries_for_path(&path, &group)?;
        }
        Ok(())
    }

    pub fn execute_all_new_entries<T>(
        &self,
        listeners: &mut [Listener<T>],
        extra: &mut Option<&mut T>,
    ) -> Result<()> {
        let mut writers = self.writer_app_ids()?;
        writers.sort();
        for writer in writers {
            let writer_dir = self.new_entries_dir(&writer);
            for name in self.fs.list_files(&writer_dir)? {
                let Some(path) = codec::decode_path(&name) else {
                    warn!(name = %name, "skipping undecodable entry file");
                    continue;
                };
                self.execute_entry_file(&writer, &name, &path, listeners, extra)?;
            }
        }
        Ok(())
    }

    fn execute_entry_file<T>(
        &self,
        writer: &str,
        name: &str,
        path: &[String],
        listeners: &mut [Listener<T>],
        extra: &mut Option<&mut T>,
    ) -> Result<()> {
        let cursor_file = self.cursor_file(writer, name);
        let offset = read_cursor(&self.fs, &cursor_file)?;
        let (bytes, _) = self
            .fs
            .read_from(&self.new_entries_dir(writer).join(name), offset)?;
        let (lines, consumed) = complete_lines(&bytes);
        if consumed == 0 {
            return Ok(());
        }
        let batch: Vec<Entry> = lines.iter().filter_map(|line| Entry::from_line(line)).collect();
        trace!(writer, ?path, count = batch.len(), "read new entries");

        let stored_file = self.stored_dir(&self.own_app_id).join(name);
        let mut snapshot = stored::read_snapshot(&self.fs, &stored_file)?;
        let survivors = stored::classify(batch, &snapshot);
        if stored::absorb_max(&mut snapshot, survivors.iter().cloned()) {
            stored::write_snapshot(&self.fs, &stored_file, &snapshot)?;
        }

        if deliver(listeners, path, &survivors, extra, MetadataFilter::Strip) {
            write_cursor(&self.fs, &cursor_file, offset + consumed)?;
        }
        Ok(())
    }

    pub fn execute_stored_entries_for_path_prefix<T>(
        &self,
        prefix: &[String],
        listeners: &mut [Listener<T>],
        extra: &mut Option<&mut T>,
        keys: Option<&[Value]>,
        filter: MetadataFilter,
    ) -> Result<()> {
        let dirs = self.stored_dirs()?;
        for path in stored::stored_paths(&self.fs, &dirs, prefix)? {
            self.execute_stored_path(&dirs, &path, listeners, extra, keys, filter)?;
        }
        Ok(())
    }

    pub fn execute_stored_entries_for_path_exact<T>(
        &self,
        path: &[String],
        listeners: &mut [Listener<T>],
        extra: &mut Option<&mut T>,
        keys: Option<&[Value]>,
    ) -> Result<()> {
        let dirs = self.stored_dirs()?;
        self.execute_stored_path(&dirs, path, listeners, extra, keys, MetadataFilter::Strip)
    }

    fn stored_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut apps = self.stored_app_ids()?;
        apps.sort();
        Ok(apps.iter().map(|app| self.stored_dir(app)).collect())
    }

    fn execute_stored_path<T>(
        &self,
        dirs: &[PathBuf],
        path: &[String],
        listeners: &mut [Listener<T>],
        extra: &mut Option<&mut T>,
        keys: Option<&[Value]>,
        filter: MetadataFilter,
    ) -> Result<()> {
        let merged = stored::fold_path(&self.fs, dirs, &codec::encode_path(path))?;
        let entries: Vec<Entry> = merged
            .into_values()
            .filter(|entry| keys.is_none_or(|keys| keys.contains(&entry.key)))
            .collect();
        deliver(listeners, path, &entries, extra, filter);
        Ok(())
    }

    /// Paths this app owns and may delete after migrating away from V1.
    pub fn own_subtree(&self) -> Vec<PathBuf> {
        vec![
            self.new_entries_dir(&self.own_app_id),
            self.stored_dir(&self.own_app_id),
            self.sub.join("read").join(&self.own_app_id),
        ]
    }
}

pub(crate) fn group_by_path(entries: &[EntryWithPath]) -> Vec<(Vec<String>, Vec<Entry>)> {
    let mut groups: Vec<(Vec<String>, Vec<Entry>)> = Vec::new();
    for item in entries {
        match groups.iter_mut().find(|(path, _)| *path == item.path) {
            Some((_, group)) => group.push(item.entry.clone()),
            None => groups.push((item.path.clone(), vec![item.entry.clone()])),
        }
    }
    groups
}

fn read_cursor(fs: &Arc<dyn SyncFs>, file: &std::path::Path) -> Result<u64> {
    let Some(bytes) = fs.read(file)? else {
        return Ok(0);
    };
    match std::str::from_utf8(&bytes).ok().and_then(|s| s.trim().parse().ok()) {
        Some(offset) => Ok(offset),
        None => {
            warn!(file = %file.display(), "unreadable cursor, rereading from start");
            Ok(0)
        }
    }
}

fn write_cursor(fs: &Arc<dyn SyncFs>, file: &std::path::Path, offset: u64) -> Result<()> {
    fs.write(file, offset.to_string().as_bytes())
}
