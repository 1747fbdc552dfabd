//! Listeners: callbacks resolved by path prefix.
//!
//! A listener owns a `subpath`; it receives every delivered entry whose path
//! has that subpath as prefix. Callbacks get the full path. The `extra`
//! argument is the caller's typed state; during `init_stored_entries` no
//! extra exists and listeners are not invoked, but delivery still counts as
//! successful so cursors advance.

use tracing::{debug, info};

use crate::entry::{Entry, is_metadata_entry};

type EntryCallback<T> = Box<dyn FnMut(&[String], &Entry, &mut T) -> bool>;
type EntriesCallback<T> = Box<dyn FnMut(&[String], &[Entry], &mut T) -> bool>;

enum Kind<T> {
    Entry(EntryCallback<T>),
    Entries(EntriesCallback<T>),
}

pub struct Listener<T> {
    subpath: Vec<String>,
    kind: Kind<T>,
}

impl<T> Listener<T> {
    /// Per-entry listener; delivery always counts as successful.
    pub fn entry(
        subpath: Vec<String>,
        mut on_entry: impl FnMut(&[String], &Entry, &mut T) + 'static,
    ) -> Self {
        Self {
            subpath,
            kind: Kind::Entry(Box::new(move |path, entry, extra| {
                on_entry(path, entry, extra);
                true
            })),
        }
    }

    /// Per-entry listener; returning `false` re-delivers later.
    pub fn entry_with_success(
        subpath: Vec<String>,
        on_entry: impl FnMut(&[String], &Entry, &mut T) -> bool + 'static,
    ) -> Self {
        Self {
            subpath,
            kind: Kind::Entry(Box::new(on_entry)),
        }
    }

    /// Batch listener for one path; returning `false` re-delivers the whole
    /// batch.
    pub fn entries(
        subpath: Vec<String>,
        on_entries: impl FnMut(&[String], &[Entry], &mut T) -> bool + 'static,
    ) -> Self {
        Self {
            subpath,
            kind: Kind::Entries(Box::new(on_entries)),
        }
    }

    fn matches(&self, path: &[String]) -> bool {
        path.len() >= self.subpath.len() && self.subpath == path[..self.subpath.len()]
    }
}

/// Whether internal `["info"]` metadata entries reach the callbacks.
///
/// They never reach user listeners; the upgrade replay's collector must see
/// them so migrated state stays complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MetadataFilter {
    Strip,
    Keep,
}

/// Deliver `entries` at `path` to the first matching listener.
///
/// Returns whether delivery succeeded. An empty (post-filter) batch, a path
/// no listener matches, and init mode (no extra) all succeed.
pub(crate) fn deliver<T>(
    listeners: &mut [Listener<T>],
    path: &[String],
    entries: &[Entry],
    extra: &mut Option<&mut T>,
    filter: MetadataFilter,
) -> bool {
    let entries: Vec<Entry> = match filter {
        MetadataFilter::Strip => entries
            .iter()
            .filter(|entry| !is_metadata_entry(path, entry))
            .cloned()
            .collect(),
        MetadataFilter::Keep => entries.to_vec(),
    };
    if entries.is_empty() {
        return true;
    }

    let Some(listener) = listeners.iter_mut().find(|l| l.matches(path)) else {
        info!(?path, count = entries.len(), "no listener for path");
        return true;
    };
    let Some(extra) = extra.as_deref_mut() else {
        return true;
    };

    match &mut listener.kind {
        Kind::Entry(on_entry) => {
            for entry in &entries {
                if !on_entry(path, entry, extra) {
                    debug!(?path, "listener rejected entry, keeping for re-delivery");
                    return false;
                }
            }
            true
        }
        Kind::Entries(on_entries) => {
            let ok = on_entries(path, &entries, extra);
            if !ok {
                debug!(?path, "listener rejected batch, keeping for re-delivery");
            }
            ok
        }
    }
}
