//! The two storage engines behind one dispatch surface.
//!
//! The façade holds the current variant and swaps it during an online
//! upgrade; everything else goes through these methods.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::Result;
use crate::entry::{Entry, EntryWithPath};
use crate::fs::SyncFs;
use crate::listener::{Listener, MetadataFilter};
use crate::v1::DecsyncV1;
use crate::v2::DecsyncV2;

pub(crate) enum Engine {
    V1(DecsyncV1),
    V2(DecsyncV2),
}

impl Engine {
    pub fn new(fs: Arc<dyn SyncFs>, sub: PathBuf, own_app_id: String, version: u64) -> Self {
        match version {
            1 => Engine::V1(DecsyncV1::new(fs, sub, own_app_id)),
            _ => Engine::V2(DecsyncV2::new(fs, sub, own_app_id)),
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Engine::V1(_) => 1,
            Engine::V2(_) => 2,
        }
    }

    pub fn set_entries(&self, entries: &[EntryWithPath]) -> Result<()> {
        match self {
            Engine::V1(engine) => engine.set_entries(entries),
            Engine::V2(engine) => engine.set_entries(entries),
        }
    }

    pub fn set_entries_for_path(&self, path: &[String], entries: &[Entry]) -> Result<()> {
        match self {
            Engine::V1(engine) => engine.set_entries_for_path(path, entries),
            Engine::V2(engine) => engine.set_entries_for_path(path, entries),
        }
    }

    pub fn execute_all_new_entries<T>(
        &self,
        listeners: &mut [Listener<T>],
        extra: &mut Option<&mut T>,
    ) -> Result<()> {
        match self {
            Engine::V1(engine) => engine.execute_all_new_entries(listeners, extra),
            Engine::V2(engine) => engine.execute_all_new_entries(listeners, extra),
        }
    }

    pub fn execute_stored_entries_for_path_prefix<T>(
        &self,
        prefix: &[String],
        listeners: &mut [Listener<T>],
        extra: &mut Option<&mut T>,
        keys: Option<&[Value]>,
        filter: MetadataFilter,
    ) -> Result<()> {
        match self {
            Engine::V1(engine) => {
                engine.execute_stored_entries_for_path_prefix(prefix, listeners, extra, keys, filter)
            }
            Engine::V2(engine) => {
                engine.execute_stored_entries_for_path_prefix(prefix, listeners, extra, keys, filter)
            }
        }
    }

    pub fn execute_stored_entries_for_path_exact<T>(
        &self,
        path: &[String],
        listeners: &mut [Listener<T>],
        extra: &mut Option<&mut T>,
        keys: Option<&[Value]>,
    ) -> Result<()> {
        match self {
            Engine::V1(engine) => {
                engine.execute_stored_entries_for_path_exact(path, listeners, extra, keys)
            }
            Engine::V2(engine) => {
                engine.execute_stored_entries_for_path_exact(path, listeners, extra, keys)
            }
        }
    }

    /// Paths owned by this app under the engine's layout.
    pub fn own_subtree(&self) -> Vec<PathBuf> {
        match self {
            Engine::V1(engine) => engine.own_subtree(),
            Engine::V2(engine) => engine.own_subtree(),
        }
    }
}
