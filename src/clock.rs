//! Datetime source.
//!
//! All stamps in the on-disk format come from [`current_datetime`]: an
//! ISO-8601 UTC string whose first ten characters form a `YYYY-MM-DD` date.
//! A process-wide source with a test override keeps entry ordering
//! reproducible in tests.

use std::sync::{Arc, Mutex, OnceLock, RwLock};

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

use crate::entry::Datetime;

const DATETIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// How far back an app's `last-active` may lie while still counting as
/// recently active for legacy detection.
const ACTIVE_WINDOW: Duration = Duration::days(30);

pub trait DatetimeSource: Send + Sync {
    fn now_utc(&self) -> OffsetDateTime;
}

struct SystemDatetimeSource;

impl DatetimeSource for SystemDatetimeSource {
    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

fn datetime_source() -> &'static RwLock<Arc<dyn DatetimeSource>> {
    static SOURCE: OnceLock<RwLock<Arc<dyn DatetimeSource>>> = OnceLock::new();
    SOURCE.get_or_init(|| RwLock::new(Arc::new(SystemDatetimeSource)))
}

fn now() -> OffsetDateTime {
    let source = datetime_source()
        .read()
        .unwrap_or_else(|err| err.into_inner());
    source.now_utc()
}

fn format(moment: OffsetDateTime) -> Datetime {
    Datetime::new(
        moment
            .format(&DATETIME_FORMAT)
            .expect("datetime format cannot fail"),
    )
}

/// The current UTC datetime as an on-disk stamp.
pub fn current_datetime() -> Datetime {
    format(now())
}

/// The `YYYY-MM-DD` prefix of the current datetime.
pub fn today() -> String {
    current_datetime().date().to_string()
}

/// The recently-active threshold: stamps older than this belong to apps
/// that no longer block a format upgrade.
pub(crate) fn old_datetime() -> Datetime {
    format(now() - ACTIVE_WINDOW)
}

static SOURCE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Restores the previous datetime source on drop.
pub struct DatetimeSourceGuard {
    prev: Arc<dyn DatetimeSource>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl Drop for DatetimeSourceGuard {
    fn drop(&mut self) {
        let mut guard = datetime_source()
            .write()
            .unwrap_or_else(|err| err.into_inner());
        *guard = self.prev.clone();
    }
}

/// Replace the process-wide datetime source until the guard drops.
///
/// Serialized by a lock so concurrent tests cannot interleave overrides.
pub fn set_datetime_source_for_tests(source: Arc<dyn DatetimeSource>) -> DatetimeSourceGuard {
    let lock = SOURCE_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|err| err.into_inner());
    let mut guard = datetime_source()
        .write()
        .unwrap_or_else(|err| err.into_inner());
    let prev = guard.clone();
    *guard = source;
    DatetimeSourceGuard {
        prev,
        _lock: lock,
    }
}
