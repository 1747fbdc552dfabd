//! Crate error taxonomy.
//!
//! Only conditions the caller can act on become errors: a broken or
//! too-new `.decsync-info`, and I/O failures surfaced by the filesystem
//! capability. Malformed entry lines are logged and skipped, and listener
//! failure is a boolean that drives cursor retention; neither is an `Error`.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// `.decsync-info` exists but cannot be parsed or is structurally wrong.
    #[error("decsync info is invalid: {reason}")]
    InvalidInfo { reason: String },

    /// `.decsync-info` declares a version this build does not know.
    #[error("decsync version {required} is not supported (highest supported is {supported})")]
    UnsupportedVersion { required: u64, supported: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_info(reason: impl Into<String>) -> Self {
        Error::InvalidInfo {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
