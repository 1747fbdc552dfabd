//! The `Decsync` façade: version routing, listeners, maintenance, upgrade.
//!
//! One instance serves one app on one sync type (and optional collection).
//! It owns the listener list and the per-app local metadata, routes every
//! operation to the active storage engine, and keeps the shared directory
//! healthy: publishing `last-active` and `supported-version`, and upgrading
//! the on-disk format online once no active peer still needs the old one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::entry::{Entry, EntryWithPath, StoredEntry};
use crate::fs::{NativeFs, NodeKind, SyncFs};
use crate::info::{DEFAULT_VERSION, DecsyncInfo, LocalInfo, SUPPORTED_VERSION};
use crate::listener::{Listener, MetadataFilter};
use crate::queries::{active_app_data, sub_dir};
use crate::{Error, Result, clock};

/// One app's handle on a synced key/value tree.
///
/// `T` is the caller-defined state threaded into every listener invocation.
/// An instance must be driven by one caller task at a time; multiple
/// processes on the same directory are the normal case and coordinate
/// purely through the layout's ownership rules.
pub struct Decsync<T> {
    fs: Arc<dyn SyncFs>,
    decsync_dir: PathBuf,
    sub: PathBuf,
    own_app_id: String,
    local: LocalInfo,
    listeners: Vec<Listener<T>>,
    engine: Engine,
    is_in_init: bool,
}

impl<T> std::fmt::Debug for Decsync<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decsync")
            .field("decsync_dir", &self.decsync_dir)
            .field("sub", &self.sub)
            .field("own_app_id", &self.own_app_id)
            .field("is_in_init", &self.is_in_init)
            .finish_non_exhaustive()
    }
}

impl<T> Decsync<T> {
    /// Open (creating if needed) a DecSync directory on the native
    /// filesystem.
    pub fn new(
        decsync_dir: impl AsRef<Path>,
        local_dir: impl AsRef<Path>,
        sync_type: &str,
        collection: Option<&str>,
        own_app_id: &str,
    ) -> Result<Self> {
        Self::with_fs(
            Arc::new(NativeFs::new()),
            decsync_dir.as_ref(),
            local_dir.as_ref(),
            sync_type,
            collection,
            own_app_id,
        )
    }

    /// Open over an explicit filesystem capability.
    pub fn with_fs(
        fs: Arc<dyn SyncFs>,
        decsync_dir: &Path,
        local_dir: &Path,
        sync_type: &str,
        collection: Option<&str>,
        own_app_id: &str,
    ) -> Result<Self> {
        let info = DecsyncInfo::load_or_create(&fs, decsync_dir)?;
        let sub = sub_dir(decsync_dir, sync_type, collection);
        let mut local = LocalInfo::load(&fs, local_dir)?;

        let version = match local.version() {
            Some(version) => version,
            None => {
                let version = detect_version(&fs, &sub, own_app_id, info.version)?;
                local.set(&fs, "version", version.into())?;
                version
            }
        };
        if version > SUPPORTED_VERSION {
            return Err(Error::UnsupportedVersion {
                required: version,
                supported: SUPPORTED_VERSION,
            });
        }

        let engine = Engine::new(fs.clone(), sub.clone(), own_app_id.to_string(), version);
        Ok(Self {
            fs,
            decsync_dir: decsync_dir.to_path_buf(),
            sub,
            own_app_id: own_app_id.to_string(),
            local,
            listeners: Vec::new(),
            engine,
            is_in_init: false,
        })
    }

    pub fn own_app_id(&self) -> &str {
        &self.own_app_id
    }

    /// Format version of the active engine.
    pub fn version(&self) -> u64 {
        self.engine.version()
    }

    /// Handle entries at paths under `subpath`; delivery always succeeds.
    pub fn add_listener(
        &mut self,
        subpath: &[String],
        on_entry: impl FnMut(&[String], &Entry, &mut T) + 'static,
    ) {
        self.listeners
            .push(Listener::entry(subpath.to_vec(), on_entry));
    }

    /// Handle entries at paths under `subpath`; returning `false` keeps the
    /// entries for re-delivery on the next [`Self::execute_all_new_entries`].
    pub fn add_listener_with_success(
        &mut self,
        subpath: &[String],
        on_entry: impl FnMut(&[String], &Entry, &mut T) -> bool + 'static,
    ) {
        self.listeners
            .push(Listener::entry_with_success(subpath.to_vec(), on_entry));
    }

    /// Handle one path's entries as a batch; returning `false` re-delivers
    /// the whole batch.
    pub fn add_multi_listener(
        &mut self,
        subpath: &[String],
        on_entries: impl FnMut(&[String], &[Entry], &mut T) -> bool + 'static,
    ) {
        self.listeners
            .push(Listener::entries(subpath.to_vec(), on_entries));
    }

    /// Write one (key, value) at `path`, stamped with the current datetime.
    pub fn set_entry(&mut self, path: &[String], key: Value, value: Value) -> Result<()> {
        let entry = Entry::new(clock::current_datetime(), key, value);
        self.engine.set_entries_for_path(path, &[entry])
    }

    /// Write entries across paths. Equivalent to per-entry writes.
    pub fn set_entries(&mut self, entries: &[EntryWithPath]) -> Result<()> {
        self.engine.set_entries(entries)
    }

    /// Write entries at one path. Equivalent to per-entry writes.
    pub fn set_entries_for_path(&mut self, path: &[String], entries: &[Entry]) -> Result<()> {
        self.engine.set_entries_for_path(path, entries)
    }

    /// Process everything peers (and this app) appended since the last
    /// call, run maintenance, and deliver the surviving entries.
    pub fn execute_all_new_entries(&mut self, extra: &mut T) -> Result<()> {
        self.execute_all_new_entries_with(extra, false)
    }

    /// [`Self::execute_all_new_entries`] with maintenance optionally
    /// disabled.
    pub fn execute_all_new_entries_with(
        &mut self,
        extra: &mut T,
        disable_maintenance: bool,
    ) -> Result<()> {
        if self.is_in_init {
            return Ok(());
        }
        self.execute_inner(&mut Some(extra), disable_maintenance)
    }

    /// Advance cursors and populate the merged snapshots without invoking
    /// any listener. Run once right after install.
    pub fn init_stored_entries(&mut self) -> Result<()> {
        self.is_in_init = true;
        let result = self.execute_inner(&mut None, false);
        self.is_in_init = false;
        result
    }

    /// Replay the current merged value of one cell through the listeners.
    pub fn execute_stored_entry(&mut self, path: &[String], key: &Value, extra: &mut T) -> Result<()> {
        self.execute_stored_entries_for_path_exact(path, extra, Some(std::slice::from_ref(key)))
    }

    /// Replay the current merged values of the given cells.
    pub fn execute_stored_entries(&mut self, entries: &[StoredEntry], extra: &mut T) -> Result<()> {
        let mut groups: Vec<(Vec<String>, Vec<Value>)> = Vec::new();
        for cell in entries {
            match groups.iter_mut().find(|(path, _)| *path == cell.path) {
                Some((_, keys)) => keys.push(cell.key.clone()),
                None => groups.push((cell.path.clone(), vec![cell.key.clone()])),
            }
        }
        for (path, keys) in groups {
            self.execute_stored_entries_for_path_exact(&path, extra, Some(&keys))?;
        }
        Ok(())
    }

    /// Replay one path's merged values. `keys = None` means all keys.
    pub fn execute_stored_entries_for_path_exact(
        &mut self,
        path: &[String],
        extra: &mut T,
        keys: Option<&[Value]>,
    ) -> Result<()> {
        self.engine.execute_stored_entries_for_path_exact(
            path,
            &mut self.listeners,
            &mut Some(extra),
            keys,
        )
    }

    /// Replay merged values for every path under `prefix`. `keys = None`
    /// means all keys.
    pub fn execute_stored_entries_for_path_prefix(
        &mut self,
        prefix: &[String],
        extra: &mut T,
        keys: Option<&[Value]>,
    ) -> Result<()> {
        self.engine.execute_stored_entries_for_path_prefix(
            prefix,
            &mut self.listeners,
            &mut Some(extra),
            keys,
            MetadataFilter::Strip,
        )
    }

    fn execute_inner(&mut self, extra: &mut Option<&mut T>, disable_maintenance: bool) -> Result<()> {
        // Peers add files between scans; cached listings only serve the
        // many lookups within one scan.
        self.fs.reset_cache();
        if !disable_maintenance {
            self.maintenance()?;
        }
        self.engine
            .execute_all_new_entries(&mut self.listeners, extra)
    }

    /// Version upgrade when possible, then `last-active` and
    /// `supported-version` publication.
    fn maintenance(&mut self) -> Result<()> {
        let root_info = DecsyncInfo::load_or_create(&self.fs, &self.decsync_dir)?;
        let current = self.engine.version();
        let preferred = if root_info.fixed {
            current
        } else {
            let apps = active_app_data(&self.fs, &self.sub)?;
            if apps.iter().any(|app| app.is_legacy()) {
                current
            } else {
                DEFAULT_VERSION
            }
        };
        if preferred > current {
            self.upgrade(preferred, root_info)?;
        }

        let info_path = vec!["info".to_string()];
        let today = clock::today();
        if self.local.last_active() != Some(today.as_str()) {
            self.set_entry(
                &info_path,
                json!(format!("last-active-{}", self.own_app_id)),
                json!(today.clone()),
            )?;
            self.local.set(&self.fs, "last-active", json!(today))?;
        }

        let published = self.local.supported_version().unwrap_or(0);
        if published < SUPPORTED_VERSION {
            self.set_entry(
                &info_path,
                json!(format!("supported-version-{}", self.own_app_id)),
                json!(SUPPORTED_VERSION),
            )?;
            self.local
                .set(&self.fs, "supported-version", json!(SUPPORTED_VERSION))?;
        }
        Ok(())
    }

    /// Migrate the merged state into a fresh engine, advance the version
    /// everywhere, and clear out the superseded own subtree in the
    /// background. The caller's scan right after this picks up anything
    /// written while the migration ran.
    fn upgrade(&mut self, new_version: u64, mut root_info: DecsyncInfo) -> Result<()> {
        info!(
            from = self.engine.version(),
            to = new_version,
            "upgrading storage format"
        );
        self.fs.reset_cache();

        let mut collected: Vec<EntryWithPath> = Vec::new();
        let mut collector: Vec<Listener<Vec<EntryWithPath>>> = vec![Listener::entries(
            Vec::new(),
            |path: &[String], entries: &[Entry], out: &mut Vec<EntryWithPath>| {
                for entry in entries {
                    out.push(EntryWithPath::new(path.to_vec(), entry.clone()));
                }
                true
            },
        )];
        self.engine.execute_stored_entries_for_path_prefix(
            &[],
            &mut collector,
            &mut Some(&mut collected),
            None,
            MetadataFilter::Keep,
        )?;

        let new_engine = Engine::new(
            self.fs.clone(),
            self.sub.clone(),
            self.own_app_id.clone(),
            new_version,
        );
        new_engine.set_entries(&collected)?;

        if root_info.version < new_version {
            root_info.version = new_version;
            root_info.store(&self.fs, &self.decsync_dir)?;
        }
        self.local.set(&self.fs, "version", new_version.into())?;

        let old_engine = std::mem::replace(&mut self.engine, new_engine);
        let fs = self.fs.clone();
        let old_subtree = old_engine.own_subtree();
        std::thread::spawn(move || {
            for path in old_subtree {
                if let Err(err) = fs.delete(&path) {
                    warn!(path = %path.display(), %err, "failed to delete superseded entries");
                }
            }
            fs.reset_cache();
        });
        Ok(())
    }
}

/// Version for an app without local metadata: its own V2 subtree wins, then
/// the highest version any peer uses, then the root info version.
fn detect_version(
    fs: &Arc<dyn SyncFs>,
    sub: &Path,
    own_app_id: &str,
    info_version: u64,
) -> Result<u64> {
    if fs.node_kind(&sub.join("v2").join(own_app_id))? == NodeKind::Directory {
        return Ok(2);
    }
    if !fs.list_directories(&sub.join("v2"))?.is_empty() {
        return Ok(2);
    }
    if !fs.list_directories(&sub.join("new-entries"))?.is_empty() {
        return Ok(1);
    }
    Ok(info_version)
}
