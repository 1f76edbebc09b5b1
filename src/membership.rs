//! Membership status derivation.
//!
//! Every comparison is done on calendar dates. A time-of-day carried by the
//! stored expiration is ignored.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::user::UserProfile;

/// Days before expiration when a membership starts being reported as
/// expiring.
pub const DEFAULT_WARNING_DAYS: i64 = 30;

/// Derived classification of a membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Active,
    Expiring,
    Expired,
}

/// Parse an expiration stored either as `YYYY-MM-DD` or as an RFC 3339
/// timestamp.
pub fn parse_expiration(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok().or_else(|| {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|date| date.date_naive())
    })
}

/// Signed number of days from `today` to `expiration`.
pub fn days_until_expiry(expiration: NaiveDate, today: NaiveDate) -> i64 {
    (expiration - today).num_days()
}

/// `true` when `expiration` is strictly before `today`.
pub fn is_membership_expired(expiration: NaiveDate, today: NaiveDate) -> bool {
    expiration < today
}

/// `true` iff `0 <= days until expiry <= threshold_days`.
pub fn is_membership_expiring_soon(
    expiration: NaiveDate,
    threshold_days: i64,
    today: NaiveDate,
) -> bool {
    (0..=threshold_days).contains(&days_until_expiry(expiration, today))
}

/// Summary displayed on the member profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipInfo {
    pub status: MembershipStatus,
    pub days_until_expiry: i64,
    pub message: String,
}

/// Derivation rules parameterised by the warning threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipPolicy {
    pub warning_days: i64,
}

impl Default for MembershipPolicy {
    fn default() -> Self {
        Self {
            warning_days: DEFAULT_WARNING_DAYS,
        }
    }
}

impl MembershipPolicy {
    pub fn new(warning_days: i64) -> Self {
        Self { warning_days }
    }

    /// Classify a known expiration date.
    pub fn classify(
        &self,
        expiration: NaiveDate,
        today: NaiveDate,
    ) -> MembershipStatus {
        if is_membership_expired(expiration, today) {
            MembershipStatus::Expired
        } else if is_membership_expiring_soon(
            expiration,
            self.warning_days,
            today,
        ) {
            MembershipStatus::Expiring
        } else {
            MembershipStatus::Active
        }
    }

    /// Status of `profile`, `None` without a profile or an expiration.
    pub fn status(
        &self,
        profile: Option<&UserProfile>,
        today: NaiveDate,
    ) -> Option<MembershipStatus> {
        profile
            .and_then(|profile| profile.membership_exp)
            .map(|expiration| self.classify(expiration, today))
    }

    pub fn info(
        &self,
        profile: Option<&UserProfile>,
        today: NaiveDate,
    ) -> Option<MembershipInfo> {
        let expiration = profile?.membership_exp?;
        let status = self.classify(expiration, today);
        let days = days_until_expiry(expiration, today);

        let message = match status {
            MembershipStatus::Expired => format!(
                "Membership expired on {}. Please renew it.",
                expiration.format("%d.%m.%Y")
            ),
            MembershipStatus::Expiring if days == 0 => {
                "Membership expires today.".to_owned()
            },
            MembershipStatus::Expiring => {
                format!("Membership expires in {days} days.")
            },
            MembershipStatus::Active => format!(
                "Membership is active until {}.",
                expiration.format("%d.%m.%Y")
            ),
        };

        Some(MembershipInfo {
            status,
            days_until_expiry: days,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_parse_expiration() {
        assert_eq!(parse_expiration("2026-10-16"), Some(date("2026-10-16")));
        assert_eq!(
            parse_expiration("2026-10-16T23:59:59+00:00"),
            Some(date("2026-10-16"))
        );
        assert_eq!(parse_expiration("16.10.2026"), None);
        assert_eq!(parse_expiration(""), None);
    }

    #[test]
    fn test_expired_ignores_time_of_day() {
        let today = date("2026-10-16");

        assert!(is_membership_expired(date("2026-10-15"), today));
        assert!(!is_membership_expired(date("2026-10-16"), today));
        assert!(!is_membership_expired(date("2027-01-01"), today));

        // Late on the same day is still not expired.
        let late = parse_expiration("2026-10-16T00:00:01Z").unwrap();
        assert!(!is_membership_expired(late, today));
    }

    #[test]
    fn test_expiring_soon_bounds() {
        let today = date("2026-10-16");

        assert!(is_membership_expiring_soon(today, 30, today));
        assert!(is_membership_expiring_soon(date("2026-11-15"), 30, today));
        assert!(!is_membership_expiring_soon(date("2026-11-16"), 30, today));
        assert!(!is_membership_expiring_soon(date("2026-10-15"), 30, today));
    }

    #[test]
    fn test_classify() {
        let policy = MembershipPolicy::default();
        let today = date("2026-10-16");

        assert_eq!(
            policy.classify(date("2026-10-01"), today),
            MembershipStatus::Expired
        );
        assert_eq!(
            policy.classify(date("2026-10-26"), today),
            MembershipStatus::Expiring
        );
        assert_eq!(
            policy.classify(date("2027-10-16"), today),
            MembershipStatus::Active
        );
    }

    #[test]
    fn test_info_message() {
        use crate::user::{Role, UserProfile};

        let today = date("2026-10-16");
        let mut profile = UserProfile::new(
            "id",
            "7707083893",
            Role::Member,
            chrono::Utc::now(),
        );
        let policy = MembershipPolicy::default();

        assert_eq!(policy.info(Some(&profile), today), None);
        assert_eq!(policy.status(None, today), None);

        profile.membership_exp = Some(date("2026-10-26"));
        let info = policy.info(Some(&profile), today).unwrap();
        assert_eq!(info.status, MembershipStatus::Expiring);
        assert_eq!(info.days_until_expiry, 10);
        assert_eq!(info.message, "Membership expires in 10 days.");

        profile.membership_exp = Some(date("2026-10-01"));
        let info = policy.info(Some(&profile), today).unwrap();
        assert_eq!(info.days_until_expiry, -15);
        assert_eq!(
            info.message,
            "Membership expired on 01.10.2026. Please renew it."
        );
    }
}
