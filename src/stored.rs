//! Merged snapshots (`stored-entries`) and the merge rules.
//!
//! A snapshot holds one entry per key for one path: the authoritative view
//! from one app's perspective. Incremental reads classify incoming entries
//! against the reader's own snapshot; replay and the cross-version queries
//! fold snapshots across apps.
//!
//! Merge comparison, locked for the whole crate: entries for one key are
//! totally ordered by `(datetime, canonical value text)`, and an incoming
//! entry survives iff it is `>=` the snapshot's entry in that order.
//! Comparing content instead of arrival order makes exact datetime ties
//! converge on every device no matter who observed whom first; the equal
//! case is what re-offers entries whose delivery failed after the snapshot
//! already absorbed them.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry as MapEntry;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str;
use std::sync::Arc;

use tracing::warn;

use crate::Result;
use crate::codec;
use crate::entry::Entry;
use crate::fs::SyncFs;

/// Key text (canonical JSON) to entry.
pub(crate) type Snapshot = BTreeMap<String, Entry>;

/// Split off the complete `\n`-terminated lines of `bytes`.
///
/// Returns the lines plus the number of bytes they cover; a trailing
/// partial line is left unconsumed so a racing append is re-read whole.
/// Lines that are not valid UTF-8 are logged, skipped, and still counted as
/// consumed.
pub(crate) fn complete_lines(bytes: &[u8]) -> (Vec<&str>, u64) {
    let mut lines = Vec::new();
    let mut consumed = 0u64;
    for chunk in bytes.split_inclusive(|b| *b == b'\n') {
        if chunk.last() != Some(&b'\n') {
            break;
        }
        consumed += chunk.len() as u64;
        match str::from_utf8(&chunk[..chunk.len() - 1]) {
            Ok(line) if line.is_empty() => {}
            Ok(line) => lines.push(line),
            Err(err) => warn!(%err, "skipping non-UTF-8 line"),
        }
    }
    (lines, consumed)
}

pub(crate) fn read_snapshot(fs: &Arc<dyn SyncFs>, file: &Path) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    if let Some(bytes) = fs.read(file)? {
        let (lines, _) = complete_lines(&bytes);
        for line in lines {
            if let Some(entry) = Entry::from_line(line) {
                absorb_max(&mut snapshot, std::iter::once(entry));
            }
        }
    }
    Ok(snapshot)
}

pub(crate) fn write_snapshot(fs: &Arc<dyn SyncFs>, file: &Path, snapshot: &Snapshot) -> Result<()> {
    let mut bytes = Vec::new();
    for entry in snapshot.values() {
        bytes.extend_from_slice(entry.to_line().as_bytes());
    }
    fs.write(file, &bytes)
}

/// Whether `incoming` replaces `stored` for the same key.
///
/// Datetime decides; an exact tie falls through to the canonical value
/// text, which is deterministic and the same on every device. Identical
/// content replaces only when `allow_equal` (the re-delivery case).
fn wins(incoming: &Entry, stored: &Entry, allow_equal: bool) -> bool {
    match incoming.datetime.cmp(&stored.datetime) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => {
            match incoming.value.to_string().cmp(&stored.value.to_string()) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => allow_equal,
            }
        }
    }
}

/// Collapse a batch by key, retaining the winning entry per the merge
/// order. First-appearance order of keys is kept so a reader observes a
/// writer's entries in append order.
pub(crate) fn dedup_batch(batch: Vec<Entry>) -> Vec<Entry> {
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Entry> = Vec::new();
    for entry in batch {
        match by_key.get(&entry.key_text()) {
            Some(&i) => {
                if wins(&entry, &out[i], true) {
                    out[i] = entry;
                }
            }
            None => {
                by_key.insert(entry.key_text(), out.len());
                out.push(entry);
            }
        }
    }
    out
}

/// Classify a batch against the reader's snapshot: collapse duplicates,
/// then keep only entries the merge order does not rank below the
/// snapshot.
pub(crate) fn classify(batch: Vec<Entry>, snapshot: &Snapshot) -> Vec<Entry> {
    dedup_batch(batch)
        .into_iter()
        .filter(|entry| match snapshot.get(&entry.key_text()) {
            Some(stored) => wins(entry, stored, true),
            None => true,
        })
        .collect()
}

/// Fold observed entries into a snapshot; ties (including identical
/// content) replace. Returns whether anything changed.
pub(crate) fn absorb_max(
    snapshot: &mut Snapshot,
    entries: impl IntoIterator<Item = Entry>,
) -> bool {
    absorb(snapshot, entries, true)
}

/// Fold an app's own written entries into its snapshot; an entry not
/// strictly newer than the stored one is discarded. Returns whether
/// anything changed.
pub(crate) fn absorb_newer(
    snapshot: &mut Snapshot,
    entries: impl IntoIterator<Item = Entry>,
) -> bool {
    absorb(snapshot, entries, false)
}

/// Fold entries from a newer on-disk format over an older format's view:
/// an entry replaces the stored one whenever its datetime is at least as
/// new, regardless of content. Cross-format exact-datetime ties go to the
/// newer format, unlike the content rule used within one format.
pub(crate) fn absorb_from_newer_format(
    snapshot: &mut Snapshot,
    entries: impl IntoIterator<Item = Entry>,
) {
    for entry in entries {
        match snapshot.entry(entry.key_text()) {
            MapEntry::Vacant(slot) => {
                slot.insert(entry);
            }
            MapEntry::Occupied(mut slot) => {
                if entry.datetime >= slot.get().datetime {
                    slot.insert(entry);
                }
            }
        }
    }
}

fn absorb(
    snapshot: &mut Snapshot,
    entries: impl IntoIterator<Item = Entry>,
    allow_equal: bool,
) -> bool {
    let mut changed = false;
    for entry in entries {
        match snapshot.entry(entry.key_text()) {
            MapEntry::Vacant(slot) => {
                slot.insert(entry);
                changed = true;
            }
            MapEntry::Occupied(mut slot) => {
                if wins(&entry, slot.get(), allow_equal) && *slot.get() != entry {
                    slot.insert(entry);
                    changed = true;
                }
            }
        }
    }
    changed
}

/// Union of decoded snapshot paths across `dirs`, restricted to `prefix`.
pub(crate) fn stored_paths(
    fs: &Arc<dyn SyncFs>,
    dirs: &[PathBuf],
    prefix: &[String],
) -> Result<BTreeSet<Vec<String>>> {
    let mut paths = BTreeSet::new();
    for dir in dirs {
        for name in fs.list_files(dir)? {
            let Some(path) = codec::decode_path(&name) else {
                warn!(name = %name, "skipping undecodable snapshot file");
                continue;
            };
            if path.len() >= prefix.len() && prefix == &path[..prefix.len()] {
                paths.insert(path);
            }
        }
    }
    Ok(paths)
}

/// Merged view of one path folded across the snapshots in `dirs`, in order.
pub(crate) fn fold_path(fs: &Arc<dyn SyncFs>, dirs: &[PathBuf], encoded: &str) -> Result<Snapshot> {
    let mut merged = Snapshot::new();
    for dir in dirs {
        let snapshot = read_snapshot(fs, &dir.join(encoded))?;
        absorb_max(&mut merged, snapshot.into_values());
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Datetime;
    use serde_json::json;

    fn entry(dt: &str, key: &str, value: i64) -> Entry {
        Entry::new(Datetime::new(dt), json!(key), json!(value))
    }

    #[test]
    fn complete_lines_leaves_partial_tail() {
        let (lines, consumed) = complete_lines(b"one\ntwo\npart");
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(consumed, 8);

        let (lines, consumed) = complete_lines(b"");
        assert!(lines.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn dedup_keeps_highest_datetime_and_append_order() {
        let batch = vec![
            entry("2024-05-01T10:00:00", "a", 1),
            entry("2024-05-01T10:00:02", "b", 2),
            entry("2024-05-01T10:00:01", "a", 3),
            entry("2024-05-01T10:00:01", "b", 4),
        ];
        let deduped = dedup_batch(batch);
        assert_eq!(deduped, vec![
            entry("2024-05-01T10:00:01", "a", 3),
            entry("2024-05-01T10:00:02", "b", 2),
        ]);
    }

    #[test]
    fn dedup_tie_resolves_by_value_not_position() {
        let batch = vec![
            entry("2024-05-01T10:00:00", "a", 1),
            entry("2024-05-01T10:00:00", "a", 2),
        ];
        assert_eq!(dedup_batch(batch), vec![entry("2024-05-01T10:00:00", "a", 2)]);

        let batch = vec![
            entry("2024-05-01T10:00:00", "a", 2),
            entry("2024-05-01T10:00:00", "a", 1),
        ];
        assert_eq!(dedup_batch(batch), vec![entry("2024-05-01T10:00:00", "a", 2)]);
    }

    #[test]
    fn classify_discards_older_keeps_equal_and_newer() {
        let mut snapshot = Snapshot::new();
        absorb_max(&mut snapshot, vec![entry("2024-05-01T10:00:05", "a", 1)]);

        let survivors = classify(
            vec![
                entry("2024-05-01T10:00:04", "a", 2),
                entry("2024-05-01T10:00:05", "b", 3),
            ],
            &snapshot,
        );
        assert_eq!(survivors, vec![entry("2024-05-01T10:00:05", "b", 3)]);

        let survivors = classify(vec![entry("2024-05-01T10:00:05", "a", 4)], &snapshot);
        assert_eq!(survivors, vec![entry("2024-05-01T10:00:05", "a", 4)]);
    }

    #[test]
    fn absorb_newer_discards_entries_the_merge_order_ranks_below() {
        let mut snapshot = Snapshot::new();
        assert!(absorb_newer(&mut snapshot, vec![entry("2024-05-01T10:00:00", "a", 2)]));
        assert!(!absorb_newer(&mut snapshot, vec![entry("2024-05-01T10:00:00", "a", 1)]));
        assert!(!absorb_newer(&mut snapshot, vec![entry("2024-05-01T09:00:00", "a", 9)]));
        assert_eq!(snapshot.values().next().unwrap().value, json!(2));

        assert!(absorb_newer(&mut snapshot, vec![entry("2024-05-01T11:00:00", "a", 1)]));
        assert_eq!(snapshot.values().next().unwrap().value, json!(1));
    }

    #[test]
    fn newer_format_wins_exact_datetime_ties_regardless_of_content() {
        let mut snapshot = Snapshot::new();
        absorb_max(&mut snapshot, vec![entry("2024-05-01T10:00:00", "a", 9)]);

        // The content rule would keep 9; the format rule must not.
        absorb_from_newer_format(&mut snapshot, vec![entry("2024-05-01T10:00:00", "a", 1)]);
        assert_eq!(snapshot.values().next().unwrap().value, json!(1));

        absorb_from_newer_format(&mut snapshot, vec![entry("2024-05-01T09:00:00", "a", 5)]);
        assert_eq!(snapshot.values().next().unwrap().value, json!(1));
    }

    #[test]
    fn merge_order_is_observation_order_independent() {
        let first = entry("2024-05-01T10:00:00", "a", 1);
        let second = entry("2024-05-01T10:00:00", "a", 2);

        let mut forward = Snapshot::new();
        absorb_max(&mut forward, vec![first.clone()]);
        absorb_max(&mut forward, vec![second.clone()]);

        let mut backward = Snapshot::new();
        absorb_max(&mut backward, vec![second]);
        absorb_max(&mut backward, vec![first]);

        assert_eq!(forward, backward);
        assert_eq!(forward.values().next().unwrap().value, json!(2));
    }

    #[test]
    fn snapshot_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs: Arc<dyn SyncFs> = Arc::new(crate::fs::NativeFs::new());
        let file = dir.path().join("snap");

        let mut snapshot = Snapshot::new();
        absorb_max(&mut snapshot, vec![
            entry("2024-05-01T10:00:00", "a", 1),
            entry("2024-05-01T10:00:01", "b", 2),
        ]);
        write_snapshot(&fs, &file, &snapshot).unwrap();

        assert_eq!(read_snapshot(&fs, &file).unwrap(), snapshot);
    }
}
