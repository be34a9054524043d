//! Small helpers shared across the crate.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{DeltaResult, Error};

/// Convenient wrapper for error checks that should return early.
macro_rules! require {
    ($cond:expr, $err:expr) => {
        if !($cond) {
            return Err($err);
        }
    };
}
pub(crate) use require;

/// Current wall clock time in milliseconds since the unix epoch.
pub(crate) fn current_time_ms() -> DeltaResult<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::generic("system clock is before the unix epoch"))?;
    i64::try_from(duration.as_millis())
        .map_err(|_| Error::generic("system clock overflows an i64 of milliseconds"))
}
