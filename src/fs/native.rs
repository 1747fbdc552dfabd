//! `std::fs`-backed store with a directory-listing cache.
//!
//! The cache exists because one scan in `execute_all_new_entries` lists the
//! same writer directories many times. It never survives across scans: the
//! façade calls `reset_cache` at the start of each one, and local mutations
//! invalidate the affected parent in between.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{NodeKind, SyncFs};
use crate::Result;

#[derive(Default)]
pub struct NativeFs {
    listings: Mutex<HashMap<PathBuf, Listing>>,
}

#[derive(Clone, Default)]
struct Listing {
    directories: Vec<String>,
    files: Vec<String>,
}

impl NativeFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn invalidate_parent(&self, path: &Path) {
        let mut listings = self.listings.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(parent) = path.parent() {
            listings.remove(parent);
        }
        listings.remove(path);
    }

    /// A mutation that created intermediate directories changed listings at
    /// unknown depth; drop everything.
    fn invalidate_all(&self) {
        self.listings
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clear();
    }

    fn listing(&self, path: &Path) -> Result<Listing> {
        {
            let listings = self.listings.lock().unwrap_or_else(|err| err.into_inner());
            if let Some(cached) = listings.get(path) {
                return Ok(cached.clone());
            }
        }

        let mut listing = Listing::default();
        match fs::read_dir(path) {
            Ok(entries) => {
                for dirent in entries {
                    let dirent = dirent?;
                    let Ok(name) = dirent.file_name().into_string() else {
                        continue;
                    };
                    let kind = dirent.file_type()?;
                    if kind.is_dir() {
                        listing.directories.push(name);
                    } else if kind.is_file() {
                        listing.files.push(name);
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        listing.directories.sort();
        listing.files.sort();

        let mut listings = self.listings.lock().unwrap_or_else(|err| err.into_inner());
        listings.insert(path.to_path_buf(), listing.clone());
        Ok(listing)
    }

    /// Returns whether any directory had to be created.
    fn create_parent(path: &Path) -> io::Result<bool> {
        match path.parent() {
            Some(dir) if !dir.is_dir() => {
                fs::create_dir_all(dir)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl SyncFs for NativeFs {
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let created = Self::create_parent(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let temp = tempfile::NamedTempFile::new_in(dir)?;
        fs::write(temp.path(), bytes)?;
        temp.persist(path).map_err(|err| err.error)?;
        if created {
            self.invalidate_all();
        } else {
            self.invalidate_parent(path);
        }
        Ok(())
    }

    fn append(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let created = Self::create_parent(path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(bytes)?;
        if created {
            self.invalidate_all();
        } else {
            self.invalidate_parent(path);
        }
        Ok(())
    }

    fn read_from(&self, path: &Path, offset: u64) -> Result<(Vec<u8>, u64)> {
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), offset)),
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let end = offset + bytes.len() as u64;
        Ok((bytes, end))
    }

    fn length(&self, path: &Path) -> Result<Option<u64>> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn list_directories(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self.listing(path)?.directories)
    }

    fn list_files(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self.listing(path)?.files)
    }

    fn node_kind(&self, path: &Path) -> Result<NodeKind> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(NodeKind::Directory),
            Ok(_) => Ok(NodeKind::File),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(NodeKind::Absent),
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let result = match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        };
        // A recursive delete may have taken cached descendants with it.
        self.invalidate_all();
        result.map_err(Into::into)
    }

    fn reset_cache(&self) {
        self.listings
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clear();
    }
}
