//! Entries: the (datetime, key, value) triples that make up the logical map.
//!
//! Line format throughout the on-disk layout is one JSON value per line,
//! UTF-8, `\n`-terminated. Lines that fail to parse or have the wrong arity
//! are logged and skipped, never fatal.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// ISO-8601 UTC datetime string, lexicographically comparable.
///
/// The first ten characters form a `YYYY-MM-DD` date. Comparison is plain
/// string order, which for this format equals chronological order.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Datetime(String);

impl Datetime {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `YYYY-MM-DD` prefix.
    pub fn date(&self) -> &str {
        let end = self.0.len().min(10);
        &self.0[..end]
    }
}

impl PartialOrd for Datetime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datetime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for Datetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Datetime({:?})", self.0)
    }
}

impl fmt::Display for Datetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One update record. Immutable once on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub datetime: Datetime,
    pub key: Value,
    pub value: Value,
}

impl Entry {
    pub fn new(datetime: Datetime, key: Value, value: Value) -> Self {
        Self {
            datetime,
            key,
            value,
        }
    }

    /// Canonical text of the key, used to group entries per logical cell.
    pub(crate) fn key_text(&self) -> String {
        self.key.to_string()
    }

    /// Serialize as a `[datetime, key, value]` line, `\n`-terminated.
    pub(crate) fn to_line(&self) -> String {
        let mut line = serde_json::to_string(&(&self.datetime, &self.key, &self.value))
            .expect("entry serialization cannot fail");
        line.push('\n');
        line
    }

    /// Parse a `[datetime, key, value]` line. `None` means log-and-skip.
    pub(crate) fn from_line(line: &str) -> Option<Self> {
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(err) => {
                warn!(line, %err, "skipping unparsable entry line");
                return None;
            }
        };
        let Some([datetime, key, value]) = as_array::<3>(&parsed) else {
            warn!(line, "skipping entry line with wrong shape");
            return None;
        };
        let Some(datetime) = datetime.as_str() else {
            warn!(line, "skipping entry line with non-string datetime");
            return None;
        };
        Some(Self {
            datetime: Datetime::new(datetime),
            key: key.clone(),
            value: value.clone(),
        })
    }
}

/// An entry together with the path it applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryWithPath {
    pub path: Vec<String>,
    pub entry: Entry,
}

impl EntryWithPath {
    pub fn new(path: Vec<String>, entry: Entry) -> Self {
        Self { path, entry }
    }

    /// Serialize as a `[[seg, ...], datetime, key, value]` line.
    pub(crate) fn to_line(&self) -> String {
        let mut line = serde_json::to_string(&(
            &self.path,
            &self.entry.datetime,
            &self.entry.key,
            &self.entry.value,
        ))
        .expect("entry serialization cannot fail");
        line.push('\n');
        line
    }

    /// Parse a `[[seg, ...], datetime, key, value]` line.
    pub(crate) fn from_line(line: &str) -> Option<Self> {
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(err) => {
                warn!(line, %err, "skipping unparsable entry line");
                return None;
            }
        };
        let Some([path, datetime, key, value]) = as_array::<4>(&parsed) else {
            warn!(line, "skipping entry line with wrong shape");
            return None;
        };
        let Some(path) = path.as_array() else {
            warn!(line, "skipping entry line with non-array path");
            return None;
        };
        let path: Option<Vec<String>> = path
            .iter()
            .map(|seg| seg.as_str().map(str::to_string))
            .collect();
        let Some(path) = path else {
            warn!(line, "skipping entry line with non-string path segment");
            return None;
        };
        let Some(datetime) = datetime.as_str() else {
            warn!(line, "skipping entry line with non-string datetime");
            return None;
        };
        Some(Self {
            path,
            entry: Entry::new(Datetime::new(datetime), key.clone(), value.clone()),
        })
    }
}

/// Identifies one merged cell in the logical map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEntry {
    pub path: Vec<String>,
    pub key: Value,
}

impl StoredEntry {
    pub fn new(path: Vec<String>, key: Value) -> Self {
        Self { path, key }
    }
}

/// Whether an entry on path `["info"]` is internal metadata.
///
/// `last-active-<appId>` and `supported-version-<appId>` keys are consumed
/// by maintenance and the cross-version queries; they are stripped before
/// listener dispatch.
pub(crate) fn is_metadata_entry(path: &[String], entry: &Entry) -> bool {
    if path != ["info"] {
        return false;
    }
    match entry.key.as_str() {
        Some(key) => key.starts_with("last-active-") || key.starts_with("supported-version-"),
        None => false,
    }
}

fn as_array<const N: usize>(value: &Value) -> Option<[&Value; N]> {
    let array = value.as_array()?;
    if array.len() != N {
        return None;
    }
    let mut out = [value; N];
    for (slot, item) in out.iter_mut().zip(array) {
        *slot = item;
    }
    Some(out)
}
