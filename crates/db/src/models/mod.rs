mod artifact;
mod run_state;
mod task;

pub use artifact::*;
pub use run_state::*;
pub use task::*;

use chrono::{DateTime, TimeZone, Utc};

pub(crate) fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

pub(crate) fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}
