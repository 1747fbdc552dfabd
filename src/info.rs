//! Root and per-app metadata files.
//!
//! `.decsync-info` sits at the root of the shared directory and pins the
//! format version for every participant; its `version` only ever advances.
//! The local info file is private to one app instance, never synced, and
//! rewritten in full on every change.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::fs::SyncFs;
use crate::{Error, Result};

/// Version a freshly created directory gets, and the version maintenance
/// upgrades towards.
pub const DEFAULT_VERSION: u64 = 2;

/// Highest on-disk format version this build understands.
pub const SUPPORTED_VERSION: u64 = 2;

pub(crate) const INFO_FILE_NAME: &str = ".decsync-info";

/// Parsed `.decsync-info`. Unknown fields survive a rewrite.
#[derive(Clone, Debug)]
pub(crate) struct DecsyncInfo {
    pub version: u64,
    pub fixed: bool,
    rest: Map<String, Value>,
}

impl DecsyncInfo {
    fn with_version(version: u64) -> Self {
        Self {
            version,
            fixed: false,
            rest: Map::new(),
        }
    }

    /// Load the root info file, creating it at [`DEFAULT_VERSION`] when the
    /// directory is new.
    pub fn load_or_create(fs: &Arc<dyn SyncFs>, decsync_dir: &Path) -> Result<Self> {
        let path = info_path(decsync_dir);
        match fs.read(&path)? {
            Some(bytes) => {
                let info = Self::parse(&bytes)?;
                if info.version > SUPPORTED_VERSION {
                    return Err(Error::UnsupportedVersion {
                        required: info.version,
                        supported: SUPPORTED_VERSION,
                    });
                }
                Ok(info)
            }
            None => {
                let info = Self::with_version(DEFAULT_VERSION);
                info.store(fs, decsync_dir)?;
                Ok(info)
            }
        }
    }

    pub fn store(&self, fs: &Arc<dyn SyncFs>, decsync_dir: &Path) -> Result<()> {
        let mut object = self.rest.clone();
        object.insert("version".into(), Value::from(self.version));
        if self.fixed {
            object.insert("fixed".into(), Value::Bool(true));
        }
        let bytes = serde_json::to_vec(&Value::Object(object)).expect("info serialization");
        fs.write(&info_path(decsync_dir), &bytes)
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| Error::invalid_info(format!("not valid JSON: {err}")))?;
        let Value::Object(mut object) = value else {
            return Err(Error::invalid_info("not a JSON object"));
        };
        let version = match object.remove("version") {
            Some(Value::Number(n)) => n
                .as_u64()
                .filter(|v| *v >= 1)
                .ok_or_else(|| Error::invalid_info("version is not a positive integer"))?,
            Some(_) => return Err(Error::invalid_info("version is not an integer")),
            None => return Err(Error::invalid_info("version is missing")),
        };
        let fixed = match object.remove("fixed") {
            Some(Value::Bool(b)) => b,
            Some(_) => return Err(Error::invalid_info("fixed is not a boolean")),
            None => false,
        };
        Ok(Self {
            version,
            fixed,
            rest: object,
        })
    }
}

pub(crate) fn info_path(decsync_dir: &Path) -> PathBuf {
    decsync_dir.join(INFO_FILE_NAME)
}

/// Per-app local metadata: `version`, `last-active`, `supported-version`.
#[derive(Debug)]
pub(crate) struct LocalInfo {
    file: PathBuf,
    map: Map<String, Value>,
}

impl LocalInfo {
    pub fn load(fs: &Arc<dyn SyncFs>, local_dir: &Path) -> Result<Self> {
        let file = local_dir.join("info");
        let map = match fs.read(&file)? {
            Some(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    warn!(file = %file.display(), "local info is malformed, starting fresh");
                    Map::new()
                }
            },
            None => Map::new(),
        };
        Ok(Self { file, map })
    }

    pub fn version(&self) -> Option<u64> {
        self.map
            .get("version")
            .and_then(Value::as_u64)
            .filter(|v| *v >= 1)
    }

    pub fn last_active(&self) -> Option<&str> {
        self.map.get("last-active").and_then(Value::as_str)
    }

    pub fn supported_version(&self) -> Option<u64> {
        self.map.get("supported-version").and_then(Value::as_u64)
    }

    /// Insert and persist immediately; every change rewrites the file.
    pub fn set(&mut self, fs: &Arc<dyn SyncFs>, key: &str, value: Value) -> Result<()> {
        self.map.insert(key.to_string(), value);
        let bytes =
            serde_json::to_vec(&Value::Object(self.map.clone())).expect("info serialization");
        fs.write(&self.file, &bytes)
    }
}
