//! Cross-version queries over a DecSync directory.
//!
//! These answer from the merged snapshots of whatever format versions are
//! present, without constructing a `Decsync` instance. Remote snapshots are
//! advisory here: queries fold them per (path, key) by highest datetime,
//! with V2 sources winning exact ties over V1.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::Result;
use crate::clock;
use crate::codec;
use crate::fs::{NativeFs, SyncFs};
use crate::info::DEFAULT_VERSION;
use crate::stored::{self, Snapshot};

/// One app's footprint in the directory, per format version it occupies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppData {
    pub app_id: String,
    pub last_active: Option<String>,
    pub version: u64,
    pub supported_version: Option<u64>,
}

impl AppData {
    /// Whether this app blocks an automatic format upgrade: recently active
    /// and explicitly declaring a supported version below the default. An
    /// app that never declared one predates the declaration and is treated
    /// as forward-compatible.
    pub fn is_legacy(&self) -> bool {
        let Some(last_active) = &self.last_active else {
            return false;
        };
        let Some(supported) = self.supported_version else {
            return false;
        };
        last_active.as_str() >= clock::old_datetime().date() && supported < DEFAULT_VERSION
    }
}

/// Subtree root for a sync type and optional collection.
pub(crate) fn sub_dir(decsync_dir: &Path, sync_type: &str, collection: Option<&str>) -> PathBuf {
    let base = decsync_dir.join(sync_type);
    match collection {
        Some(collection) => base.join(collection),
        None => base,
    }
}

/// The latest value for every key ever written to path `["info"]`, unioned
/// across V1 and V2 sources. Returned as (key, value) pairs in key order.
pub fn get_static_info(
    decsync_dir: impl AsRef<Path>,
    sync_type: &str,
    collection: Option<&str>,
) -> Result<Vec<(Value, Value)>> {
    let fs: Arc<dyn SyncFs> = Arc::new(NativeFs::new());
    let info = static_info(&fs, &sub_dir(decsync_dir.as_ref(), sync_type, collection))?;
    Ok(info
        .into_values()
        .map(|entry| (entry.key, entry.value))
        .collect())
}

/// Count cells with a non-null merged value under `prefix`, querying the
/// single latest version present.
pub fn get_entries_count(
    decsync_dir: impl AsRef<Path>,
    sync_type: &str,
    collection: Option<&str>,
    prefix: &[String],
) -> Result<usize> {
    let fs: Arc<dyn SyncFs> = Arc::new(NativeFs::new());
    let sub = sub_dir(decsync_dir.as_ref(), sync_type, collection);
    let dirs = if v2_app_ids(&fs, &sub)?.is_empty() {
        v1_stored_dirs(&fs, &sub)?
    } else {
        v2_stored_dirs(&fs, &sub)?
    };

    let mut count = 0;
    for path in stored::stored_paths(&fs, &dirs, prefix)? {
        let merged = stored::fold_path(&fs, &dirs, &codec::encode_path(&path))?;
        count += merged.values().filter(|entry| !entry.value.is_null()).count();
    }
    Ok(count)
}

/// Every writer appId present, one row per format version it occupies,
/// sorted by (lastActive, version, appId).
pub fn get_active_apps(
    decsync_dir: impl AsRef<Path>,
    sync_type: &str,
    collection: Option<&str>,
) -> Result<Vec<AppData>> {
    let fs: Arc<dyn SyncFs> = Arc::new(NativeFs::new());
    active_app_data(&fs, &sub_dir(decsync_dir.as_ref(), sync_type, collection))
}

/// Delete one app's writer subtree for the given format version.
///
/// A V1 deletion always removes the app-private `stored-entries` and `read`
/// subtrees; the shared `new-entries` log goes too once a newer version is
/// current and nobody consumes it anymore. Cursor files other readers keep
/// for the deleted writer are left orphaned; readers skip absent writers.
pub fn delete_app_data(
    decsync_dir: impl AsRef<Path>,
    sync_type: &str,
    collection: Option<&str>,
    app_id: &str,
    version: u64,
    current_version: u64,
) -> Result<()> {
    let fs: Arc<dyn SyncFs> = Arc::new(NativeFs::new());
    let sub = sub_dir(decsync_dir.as_ref(), sync_type, collection);
    if version == 1 {
        fs.delete(&sub.join("stored-entries").join(app_id))?;
        fs.delete(&sub.join("read").join(app_id))?;
        if current_version > 1 {
            fs.delete(&sub.join("new-entries").join(app_id))?;
        }
    } else {
        fs.delete(&sub.join("v2").join(app_id))?;
    }
    Ok(())
}

/// Delete the whole subtree of a sync type / collection.
pub fn perm_delete_collection(
    decsync_dir: impl AsRef<Path>,
    sync_type: &str,
    collection: Option<&str>,
) -> Result<()> {
    let fs: Arc<dyn SyncFs> = Arc::new(NativeFs::new());
    fs.delete(&sub_dir(decsync_dir.as_ref(), sync_type, collection))
}

pub(crate) fn active_app_data(fs: &Arc<dyn SyncFs>, sub: &Path) -> Result<Vec<AppData>> {
    let info = static_info(fs, sub)?;

    let mut v1_apps: BTreeSet<String> = fs
        .list_directories(&sub.join("new-entries"))?
        .into_iter()
        .collect();
    v1_apps.extend(fs.list_directories(&sub.join("stored-entries"))?);
    let v2_apps: BTreeSet<String> = v2_app_ids(fs, sub)?.into_iter().collect();

    let mut apps = Vec::new();
    for (app_ids, version) in [(v1_apps, 1), (v2_apps, 2)] {
        for app_id in app_ids {
            let last_active = info_value(&info, &format!("last-active-{app_id}"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let supported_version =
                info_value(&info, &format!("supported-version-{app_id}")).and_then(Value::as_u64);
            apps.push(AppData {
                app_id,
                last_active,
                version,
                supported_version,
            });
        }
    }
    apps.sort_by(|a, b| {
        a.last_active
            .cmp(&b.last_active)
            .then_with(|| a.version.cmp(&b.version))
            .then_with(|| a.app_id.cmp(&b.app_id))
    });
    Ok(apps)
}

/// Merged `["info"]` snapshot across both layouts; V2 wins exact-datetime
/// ties with V1 as the newer format.
pub(crate) fn static_info(fs: &Arc<dyn SyncFs>, sub: &Path) -> Result<Snapshot> {
    let encoded = codec::encode_path(&["info".to_string()]);
    let mut merged = stored::fold_path(fs, &v1_stored_dirs(fs, sub)?, &encoded)?;
    let v2 = stored::fold_path(fs, &v2_stored_dirs(fs, sub)?, &encoded)?;
    stored::absorb_from_newer_format(&mut merged, v2.into_values());
    Ok(merged)
}

fn info_value<'a>(info: &'a Snapshot, key: &str) -> Option<&'a Value> {
    info.get(&Value::from(key).to_string())
        .map(|entry| &entry.value)
}

fn v1_stored_dirs(fs: &Arc<dyn SyncFs>, sub: &Path) -> Result<Vec<PathBuf>> {
    let root = sub.join("stored-entries");
    let mut apps = fs.list_directories(&root)?;
    apps.sort();
    Ok(apps.iter().map(|app| root.join(app)).collect())
}

fn v2_stored_dirs(fs: &Arc<dyn SyncFs>, sub: &Path) -> Result<Vec<PathBuf>> {
    let mut apps = v2_app_ids(fs, sub)?;
    apps.sort();
    Ok(apps
        .iter()
        .map(|app| sub.join("v2").join(app).join("stored-entries"))
        .collect())
}

fn v2_app_ids(fs: &Arc<dyn SyncFs>, sub: &Path) -> Result<Vec<String>> {
    fs.list_directories(&sub.join("v2"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(app_id: &str, last_active: Option<&str>, supported_version: Option<u64>) -> AppData {
        AppData {
            app_id: app_id.to_string(),
            last_active: last_active.map(str::to_string),
            version: 1,
            supported_version,
        }
    }

    #[test]
    fn legacy_needs_recent_activity_and_declared_old_support() {
        let today = clock::today();
        assert!(app("a", Some(&today), Some(1)).is_legacy());
        assert!(!app("a", Some(&today), Some(DEFAULT_VERSION)).is_legacy());
        assert!(!app("a", Some(&today), None).is_legacy(), "undeclared is forward-compatible");
        assert!(!app("a", None, Some(1)).is_legacy());
        assert!(!app("a", Some("2000-01-01"), Some(1)).is_legacy(), "stale apps do not block");
    }

    #[test]
    fn sub_dir_respects_optional_collection() {
        let root = Path::new("/d");
        assert_eq!(sub_dir(root, "contacts", None), Path::new("/d/contacts"));
        assert_eq!(
            sub_dir(root, "contacts", Some("work")),
            Path::new("/d/contacts/work")
        );
    }
}
