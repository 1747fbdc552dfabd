//! Filesystem capability consumed by the engines.
//!
//! Any ordered byte-oriented hierarchical store suffices; the engines only
//! ever touch it through [`SyncFs`]. The crate ships [`NativeFs`] over
//! `std::fs`; hosts embedding the library elsewhere provide their own.

use std::path::Path;

use crate::Result;

mod native;

pub use native::NativeFs;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Absent,
    File,
    Directory,
}

/// Byte-oriented hierarchical store.
///
/// `write` is create-or-replace and atomic per file. `append` is
/// create-if-absent, and a single append never interleaves with another
/// append to the same file. `delete` removes directories recursively and is
/// a no-op on absent nodes.
pub trait SyncFs: Send + Sync {
    /// Full contents, or `None` when the file is absent.
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<()>;

    fn append(&self, path: &Path, bytes: &[u8]) -> Result<()>;

    /// Bytes after `offset` plus the new end offset. An absent file reads
    /// as empty at offset `offset`.
    fn read_from(&self, path: &Path, offset: u64) -> Result<(Vec<u8>, u64)>;

    /// File length, or `None` when absent.
    fn length(&self, path: &Path) -> Result<Option<u64>>;

    /// Names of child directories, in unspecified order.
    fn list_directories(&self, path: &Path) -> Result<Vec<String>>;

    /// Names of child regular files, in unspecified order.
    fn list_files(&self, path: &Path) -> Result<Vec<String>>;

    fn node_kind(&self, path: &Path) -> Result<NodeKind>;

    fn delete(&self, path: &Path) -> Result<()>;

    /// Hint that any host-side caching should be dropped.
    fn reset_cache(&self);
}
