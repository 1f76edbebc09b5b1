//! User profile, roles and the registry verification contract.
//!
//! Rows fetched from the `users` table are parsed once through
//! [`UserRecord::try_into_profile`]. Consumers only ever see the total
//! [`UserProfile`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PortalError, Result};
use crate::membership::parse_expiration;
use crate::validation::{Inn, has_inn_format};

const USERS_TABLE: &str = "users";

/// Access level of the current actor.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Guest,
    Member,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    /// Parse a stored role, unknown values fall back to [`Role::Guest`].
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        raw.and_then(|raw| raw.parse().ok()).unwrap_or_default()
    }

    /// Member and admin are authenticated roles.
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Role::Guest)
    }
}

impl FromStr for Role {
    type Err = PortalError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "guest" => Ok(Role::Guest),
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            other => Err(PortalError::MalformedRecord {
                table: USERS_TABLE,
                details: format!("unknown role `{other}`"),
            }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated organization or individual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub inn: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub membership_exp: Option<NaiveDate>,
    /// Raw registry status, distinct from the derived one.
    pub membership_status: Option<String>,
    pub recovery_email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(
        id: impl Into<String>,
        inn: impl Into<String>,
        role: Role,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            inn: inn.into(),
            full_name: None,
            role,
            membership_exp: None,
            membership_status: None,
            recovery_email: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Name shown in the header, the INN when the registry had none.
    pub fn display_name(&self) -> &str {
        self.full_name.as_deref().unwrap_or(&self.inn)
    }
}

/// Row of the `users` table as the backend returns it.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRecord {
    pub id: Option<String>,
    pub inn: Option<String>,
    pub full_name: Option<String>,
    pub role: Option<String>,
    pub membership_exp: Option<String>,
    pub membership_status: Option<String>,
    pub recovery_email: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|date| date.with_timezone(&Utc))
}

impl UserRecord {
    /// Validate the row and fill bookkeeping fields.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::MalformedRecord`] without an `id` or with an
    /// INN that is not 10 or 12 digits. Other invalid fields are defaulted.
    pub fn try_into_profile(self, now: DateTime<Utc>) -> Result<UserProfile> {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PortalError::MalformedRecord {
                table: USERS_TABLE,
                details: "missing `id`".into(),
            })?;

        let inn = self.inn.unwrap_or_default();
        if !has_inn_format(&inn) {
            return Err(PortalError::MalformedRecord {
                table: USERS_TABLE,
                details: format!("invalid `inn` for user {id}"),
            });
        }

        let membership_exp = match self.membership_exp.as_deref() {
            Some(raw) => {
                let parsed = parse_expiration(raw);
                if parsed.is_none() {
                    tracing::warn!(
                        user_id = %id,
                        membership_exp = raw,
                        "ignoring unparsable membership expiration"
                    );
                }
                parsed
            },
            None => None,
        };

        Ok(UserProfile {
            role: Role::parse_lenient(self.role.as_deref()),
            full_name: self.full_name.filter(|name| !name.trim().is_empty()),
            membership_exp,
            membership_status: self.membership_status,
            recovery_email: self.recovery_email.unwrap_or_default(),
            created_at: parse_timestamp(self.created_at.as_deref())
                .unwrap_or(now),
            updated_at: parse_timestamp(self.updated_at.as_deref())
                .unwrap_or(now),
            id,
            inn,
        })
    }
}

/// Answer of the registry verification function.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryVerification {
    pub success: bool,
    pub full_name: Option<String>,
    #[serde(alias = "status")]
    pub membership_status: Option<String>,
    pub membership_expiration_date: Option<String>,
    pub message: Option<String>,
}

/// Request body of the registry verification function.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyInnRequest<'a> {
    pub inn: &'a str,
}

/// Upsert payload mirroring registry data into `users`.
///
/// `role` is only written when the row is created, so an existing admin
/// keeps its role on login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberUpsert {
    pub inn: Inn,
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub membership_status: Option<String>,
    pub membership_exp: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

impl MemberUpsert {
    /// Build the registry fields of a verified member.
    pub fn from_registry(
        inn: Inn,
        registry: &RegistryVerification,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            inn,
            full_name: registry.full_name.clone(),
            role: None,
            membership_status: registry.membership_status.clone(),
            membership_exp: registry
                .membership_expiration_date
                .as_deref()
                .and_then(parse_expiration),
            updated_at: now,
        }
    }

    /// Grant the member role to a row that does not exist yet.
    pub fn creating(mut self) -> Self {
        self.role = Some(Role::Member);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-16T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("member".parse::<Role>().unwrap(), Role::Member);
        assert_eq!(" Admin ".parse::<Role>().unwrap(), Role::Admin);
        assert!("owner".parse::<Role>().is_err());

        assert_eq!(Role::parse_lenient(Some("owner")), Role::Guest);
        assert_eq!(Role::parse_lenient(None), Role::Guest);
        assert!(!Role::Guest.is_authenticated());
        assert!(Role::Admin.is_authenticated());
    }

    #[test]
    fn test_record_defaults() {
        let record: UserRecord = serde_json::from_str(
            r#"{"id":"u1","inn":"7707083893","role":"superuser","membership_exp":"2027-01-01"}"#,
        )
        .unwrap();

        let profile = record.try_into_profile(now()).unwrap();
        assert_eq!(profile.role, Role::Guest);
        assert_eq!(
            profile.membership_exp,
            NaiveDate::from_ymd_opt(2027, 1, 1)
        );
        assert_eq!(profile.recovery_email, "");
        assert_eq!(profile.created_at, now());
        assert_eq!(profile.display_name(), "7707083893");
    }

    #[test]
    fn test_record_rejected() {
        let missing_id = UserRecord {
            inn: Some("7707083893".into()),
            ..Default::default()
        };
        assert!(matches!(
            missing_id.try_into_profile(now()),
            Err(PortalError::MalformedRecord { table: "users", .. })
        ));

        let bad_inn = UserRecord {
            id: Some("u1".into()),
            inn: Some("77070".into()),
            ..Default::default()
        };
        assert!(bad_inn.try_into_profile(now()).is_err());
    }

    #[test]
    fn test_registry_payload() {
        let registry: RegistryVerification = serde_json::from_str(
            r#"{"success":true,"fullName":"Test Org","status":"active","membershipExpirationDate":"2026-10-26"}"#,
        )
        .unwrap();
        assert_eq!(registry.membership_status.as_deref(), Some("active"));

        let inn = Inn::parse("7707083893").unwrap();
        let upsert = MemberUpsert::from_registry(inn, &registry, now());
        let json = serde_json::to_value(&upsert).unwrap();
        assert!(json.get("role").is_none());

        let json = serde_json::to_value(upsert.creating()).unwrap();
        assert_eq!(json["inn"], "7707083893");
        assert_eq!(json["role"], "member");
        assert_eq!(json["full_name"], "Test Org");
        assert_eq!(json["membership_exp"], "2026-10-26");
    }
}
