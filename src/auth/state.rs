//! Authentication reducer.

use chrono::NaiveDate;
use serde::Serialize;

use crate::membership::{MembershipPolicy, MembershipStatus};
use crate::user::{Role, UserProfile};

/// Everything the application knows about the current actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthState {
    pub user: Option<UserProfile>,
    /// Copied from `user`, [`Role::Guest`] without one.
    pub role: Role,
    pub membership_status: Option<MembershipStatus>,
    pub loading: bool,
    pub error: Option<String>,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            user: None,
            role: Role::Guest,
            membership_status: None,
            loading: true,
            error: None,
        }
    }
}

/// Events folded by [`AuthState::reduce`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    LoginStart,
    LoginSuccess(UserProfile),
    LoginFailure(String),
    Logout,
    /// Out-of-band profile refresh, loading and error untouched.
    SetUser(UserProfile),
    SetError(String),
    ClearError,
}

/// Coarse state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Loading,
    Guest,
    Member,
    Admin,
    Error,
}

impl AuthState {
    /// Pure transition function.
    pub fn reduce(
        self,
        action: AuthAction,
        policy: &MembershipPolicy,
        today: NaiveDate,
    ) -> Self {
        match action {
            AuthAction::LoginStart => Self {
                loading: true,
                error: None,
                ..Self::with_user(self.user, policy, today)
            },
            AuthAction::LoginSuccess(profile) => Self {
                loading: false,
                error: None,
                ..Self::with_user(Some(profile), policy, today)
            },
            AuthAction::LoginFailure(message) => Self {
                loading: false,
                error: Some(message),
                ..Self::with_user(None, policy, today)
            },
            AuthAction::Logout => Self {
                loading: false,
                error: None,
                ..Self::with_user(None, policy, today)
            },
            AuthAction::SetUser(profile) => Self {
                loading: self.loading,
                error: self.error,
                ..Self::with_user(Some(profile), policy, today)
            },
            AuthAction::SetError(message) => Self {
                loading: self.loading,
                error: Some(message),
                ..Self::with_user(self.user, policy, today)
            },
            AuthAction::ClearError => Self {
                loading: self.loading,
                error: None,
                ..Self::with_user(self.user, policy, today)
            },
        }
    }

    fn with_user(
        user: Option<UserProfile>,
        policy: &MembershipPolicy,
        today: NaiveDate,
    ) -> Self {
        Self {
            role: user.as_ref().map(|user| user.role).unwrap_or_default(),
            membership_status: policy.status(user.as_ref(), today),
            user,
            ..Self::default()
        }
    }

    pub fn phase(&self) -> AuthPhase {
        if self.loading {
            return AuthPhase::Loading;
        }
        if self.error.is_some() && self.user.is_none() {
            return AuthPhase::Error;
        }
        match self.role {
            Role::Guest => AuthPhase::Guest,
            Role::Member => AuthPhase::Member,
            Role::Admin => AuthPhase::Admin,
        }
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}
