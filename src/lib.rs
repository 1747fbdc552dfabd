#![forbid(unsafe_code)]

//! Conflict-free synchronization of hierarchical key/value maps over a
//! shared directory.
//!
//! No central server and no network protocol: the filesystem is the
//! protocol. Every participating app instance appends update records under
//! its own subtree and merges what it observes in its peers' subtrees by
//! last-writer-wins on an ISO-8601 datetime. Point a file-sync tool
//! (Syncthing, a cloud drive) at the directory and devices converge.
//!
//! The entry point is [`Decsync`]: register listeners, write with
//! [`Decsync::set_entry`], and call [`Decsync::execute_all_new_entries`]
//! whenever new data may have arrived.

mod appid;
mod clock;
mod codec;
mod decsync;
mod engine;
mod entry;
mod error;
pub mod fs;
mod info;
mod listener;
mod queries;
mod stored;
mod v1;
mod v2;

pub use appid::generate_app_id;
pub use clock::{
    DatetimeSource, DatetimeSourceGuard, current_datetime, set_datetime_source_for_tests, today,
};
pub use decsync::Decsync;
pub use entry::{Datetime, Entry, EntryWithPath, StoredEntry};
pub use error::{Error, Result};
pub use fs::{NativeFs, NodeKind, SyncFs};
pub use info::{DEFAULT_VERSION, SUPPORTED_VERSION};
pub use listener::Listener;
pub use queries::{
    AppData, delete_app_data, get_active_apps, get_entries_count, get_static_info,
    perm_delete_collection,
};
