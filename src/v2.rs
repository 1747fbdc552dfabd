//! V2 engine: one append log per writer, per-reader sequence cursors.
//!
//! Layout under the subtree root:
//!
//! ```text
//! v2/<writerAppId>/entries/<sequence>        [[path...], datetime, key, value] lines
//! v2/<writerAppId>/sequences/<readerAppId>   reader cursor: [sequence, byteOffset]
//! v2/<writerAppId>/stored-entries/<path-encoded>  that app's merged snapshot
//! ```
//!
//! The log is canonically one ordered byte stream; shards are decimal
//! sequence numbers and the writer rolls to the next one once the current
//! shard exceeds [`MAX_SHARD_BYTES`]. Collapsing V1's per-path files into
//! one log keeps the file count flat no matter how many paths exist, which
//! is what consumer file-sync tools need.
//!
//! A reader consumes a writer's log as maximal consecutive same-path runs
//! and commits its cursor after each accepted run; the first rejected run
//! stops the scan of that writer, so accepted runs are never re-offered and
//! rejected entries are re-read next time.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{trace, warn};

use crate::Result;
use crate::codec;
use crate::entry::{Entry, EntryWithPath};
use crate::fs::SyncFs;
use crate::listener::{Listener, MetadataFilter, deliver};
use crate::stored;
use crate::v1::group_by_path;

const MAX_SHARD_BYTES: u64 = 1 << 20;

pub(crate) struct DecsyncV2 {
    fs: Arc<dyn SyncFs>,
    sub: PathBuf,
    own_app_id: String,
    max_shard_bytes: u64,
}

/// Position in a writer's log: shard number plus byte offset within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cursor {
    sequence: u64,
    offset: u64,
}

impl Cursor {
    const START: Cursor = Cursor {
        sequence: 0,
        offset: 0,
    };
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then_with(|| self.offset.cmp(&other.offset))
    }
}

struct Run {
    path: Vec<String>,
    entries: Vec<Entry>,
    end: Cursor,
}

impl DecsyncV2 {
    pub fn new(fs: Arc<dyn SyncFs>, sub: PathBuf, own_app_id: String) -> Self {
        Self {
            fs,
            sub,
            own_app_id,
            max_shard_bytes: MAX_SHARD_BYTES,
        }
    }

    fn writer_dir(&self, app_id: &str) -> PathBuf {
        self.sub.join("v2").join(app_id)
    }

    fn shard_file(&self, app_id: &str, sequence: u64) -> PathBuf {
        self.writer_dir(app_id)
            .join("entries")
            .join(sequence.to_string())
    }

    fn cursor_file(&self, writer: &str) -> PathBuf {
        self.writer_dir(writer)
            .join("sequences")
            .join(&self.own_app_id)
    }

    fn stored_dir(&self, app_id: &str) -> PathBuf {
        self.writer_dir(app_id).join("stored-entries")
    }

    fn shard_numbers(&self, app_id: &str) -> Result<Vec<u64>> {
        let mut shards: Vec<u64> = self
            .fs
            .list_files(&self.writer_dir(app_id).join("entries"))?
            .into_iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        shards.sort_unstable();
        Ok(shards)
    }

    fn append_shard(&self) -> Result<u64> {
        let last = self
            .shard_numbers(&self.own_app_id)?
            .last()
            .copied()
            .unwrap_or(0);
        match self.fs.length(&self.shard_file(&self.own_app_id, last))? {
            Some(len) if len >= self.max_shard_bytes => Ok(last + 1),
            _ => Ok(last),
        }
    }

    pub fn set_entries(&self, entries: &[EntryWithPath]) -> Result<()> {
        let mut lines = Vec::new();
        for item in entries {
            if item.path.is_empty() {
                continue;
            }
            lines.extend_from_slice(item.to_line().as_bytes());
        }
        if lines.is_empty() {
            return Ok(());
        }
        let shard = self.append_shard()?;
        self.fs
            .append(&self.shard_file(&self.own_app_id, shard), &lines)?;

        for (path, group) in group_by_path(entries) {
            if path.is_empty() {
                continue;
            }
            let file = self
                .stored_dir(&self.own_app_id)
                .join(codec::encode_path(&path));
            let mut snapshot = stored::read_snapshot(&self.fs, &file)?;
            if stored::absorb_newer(&mut snapshot, group) {
                stored::write_snapshot(&self.fs, &file, &snapshot)?;
            }
        }
        Ok(())
    }

    pub fn set_entries_for_path(&self, path: &[String], entries: &[Entry]) -> Result<()> {
        let with_path: Vec<EntryWithPath> = entries
            .iter()
            .map(|entry| EntryWithPath::new(path.to_vec(), entry.clone()))
            .collect();
        self.set_entries(&with_path)
    }

    pub fn execute_all_new_entries<T>(
        &self,
        listeners: &mut [Listener<T>],
        extra: &mut Option<&mut T>,
    ) -> Result<()> {
        let mut writers = self.fs.list_directories(&self.sub.join("v2"))?;
        writers.sort();
        for writer in writers {
            self.execute_writer_log(&writer, listeners, extra)?;
        }
        Ok(())
    }

    fn execute_writer_log<T>(
        &self,
        writer: &str,
        listeners: &mut [Listener<T>],
        extra: &mut Option<&mut T>,
    ) -> Result<()> {
        let cursor_file = self.cursor_file(writer);
        let start = read_cursor(&self.fs, &cursor_file)?;
        let (runs, scan_end) = self.collect_runs(writer, start)?;
        trace!(writer, runs = runs.len(), "read new entry runs");

        let mut committed = start;
        for run in &runs {
            let stored_file = self
                .stored_dir(&self.own_app_id)
                .join(codec::encode_path(&run.path));
            let mut snapshot = stored::read_snapshot(&self.fs, &stored_file)?;
            let survivors = stored::classify(run.entries.clone(), &snapshot);
            if stored::absorb_max(&mut snapshot, survivors.iter().cloned()) {
                stored::write_snapshot(&self.fs, &stored_file, &snapshot)?;
            }

            if !deliver(listeners, &run.path, &survivors, extra, MetadataFilter::Strip) {
                write_cursor(&self.fs, &cursor_file, committed)?;
                return Ok(());
            }
            committed = run.end;
        }

        let end = scan_end.max(committed);
        if end > start {
            write_cursor(&self.fs, &cursor_file, end)?;
        }
        Ok(())
    }

    /// Read everything after `start` and chunk it into maximal consecutive
    /// same-path runs. Also returns the end of the fully-consumed region so
    /// trailing skipped lines and exhausted shards are not re-read forever.
    fn collect_runs(&self, writer: &str, start: Cursor) -> Result<(Vec<Run>, Cursor)> {
        let mut runs: Vec<Run> = Vec::new();
        let mut scan_end = start;
        for sequence in self
            .shard_numbers(writer)?
            .into_iter()
            .filter(|&s| s >= start.sequence)
        {
            let from = if sequence == start.sequence {
                start.offset
            } else {
                0
            };
            let (bytes, _) = self
                .fs
                .read_from(&self.shard_file(writer, sequence), from)?;

            let mut position = from;
            for chunk in bytes.split_inclusive(|b| *b == b'\n') {
                if chunk.last() != Some(&b'\n') {
                    break;
                }
                position += chunk.len() as u64;
                let end = Cursor {
                    sequence,
                    offset: position,
                };
                scan_end = end;
                let line = match std::str::from_utf8(&chunk[..chunk.len() - 1]) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(writer, %err, "skipping non-UTF-8 line");
                        continue;
                    }
                };
                if line.is_empty() {
                    continue;
                }
                let Some(item) = EntryWithPath::from_line(line) else {
                    continue;
                };
                match runs.last_mut() {
                    Some(run) if run.path == item.path => {
                        run.entries.push(item.entry);
                        run.end = end;
                    }
                    _ => runs.push(Run {
                        path: item.path,
                        entries: vec![item.entry],
                        end,
                    }),
                }
            }
        }
        Ok((runs, scan_end))
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
        let mut apps = self.fs.list_directories(&self.sub.join("v2"))?;
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

    /// Paths this app owns and may delete after migrating away from V2.
    pub fn own_subtree(&self) -> Vec<PathBuf> {
        vec![self.writer_dir(&self.own_app_id)]
    }
}

fn read_cursor(fs: &Arc<dyn SyncFs>, file: &std::path::Path) -> Result<Cursor> {
    let Some(bytes) = fs.read(file)? else {
        return Ok(Cursor::START);
    };
    match serde_json::from_slice::<(u64, u64)>(&bytes) {
        Ok((sequence, offset)) => Ok(Cursor { sequence, offset }),
        Err(err) => {
            warn!(file = %file.display(), %err, "unreadable cursor, rereading from start");
            Ok(Cursor::START)
        }
    }
}

fn write_cursor(fs: &Arc<dyn SyncFs>, file: &std::path::Path, cursor: Cursor) -> Result<()> {
    let bytes = serde_json::to_vec(&(cursor.sequence, cursor.offset)).expect("cursor serialization");
    fs.write(file, &bytes)
}
