//! Day-bucketed guest question counter.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::storage::{Storage, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct DailyCounter {
    date: NaiveDate,
    count: u32,
}

/// Local guest quota. The answer endpoint enforces the authoritative one.
#[derive(Debug, Clone)]
pub struct GuestQuota {
    storage: Storage,
    limit: u32,
}

impl GuestQuota {
    pub fn new(storage: Storage, limit: u32) -> Self {
        Self { storage, limit }
    }

    #[inline]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Questions asked on `today`. A counter from another day reads as 0.
    pub fn used(&self, today: NaiveDate) -> u32 {
        self.storage
            .get::<Option<DailyCounter>>(keys::GUEST_QUESTIONS, None)
            .filter(|counter| counter.date == today)
            .map_or(0, |counter| counter.count)
    }

    pub fn remaining(&self, today: NaiveDate) -> u32 {
        self.limit.saturating_sub(self.used(today))
    }

    pub fn is_exceeded(&self, today: NaiveDate) -> bool {
        self.remaining(today) == 0
    }

    /// Count one more question, returning the remaining ones.
    pub fn record(&self, today: NaiveDate) -> u32 {
        let count = self.used(today).saturating_add(1);
        self.storage.set(
            keys::GUEST_QUESTIONS,
            &DailyCounter { date: today, count },
        );
        self.limit.saturating_sub(count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn test_quota_rolls_over() {
        let quota = GuestQuota::new(Storage::memory(), 3);
        let today = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();

        assert_eq!(quota.remaining(today), 3);
        assert_eq!(quota.record(today), 2);
        assert_eq!(quota.record(today), 1);
        assert_eq!(quota.record(today), 0);
        assert!(quota.is_exceeded(today));

        let tomorrow = today + TimeDelta::days(1);
        assert_eq!(quota.used(tomorrow), 0);
        assert!(!quota.is_exceeded(tomorrow));
        assert_eq!(quota.record(tomorrow), 2);
    }

    #[test]
    fn test_unavailable_storage_never_blocks() {
        let storage = Storage::new(std::sync::Arc::new(crate::storage::DisabledStore));
        let quota = GuestQuota::new(storage, 3);
        let today = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();

        for _ in 0..5 {
            quota.record(today);
        }
        assert_eq!(quota.remaining(today), 3);
    }
}
