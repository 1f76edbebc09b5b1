//! Time port.
//!
//! Calendar comparisons (membership expiry, guest quota buckets) use the UTC
//! calendar day.

use chrono::{DateTime, NaiveDate, Utc};

/// Port for getting the current time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Current calendar day, time of day dropped.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    /// Current Unix timestamp in milliseconds.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// System clock using the OS time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub(crate) use fixed::FixedClock;
