//! Session store driving the authentication reducer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::Instrument;

use super::limiter::LoginLimiter;
use super::state::{AuthAction, AuthState};
use crate::backend::Backend;
use crate::clock::Clock;
use crate::config::Limits;
use crate::error::{PortalError, Result};
use crate::membership::{MembershipInfo, MembershipPolicy};
use crate::storage::Storage;
use crate::telemetry::ErrorReporter;
use crate::user::{MemberUpsert, Role, UserProfile, VerifyInnRequest};
use crate::validation::Inn;

/// Shown when the registry refuses an INN without a reason.
const DEFAULT_REJECTION: &str = "INN not found in the SRO registry.";

/// Single source of truth about the current actor.
///
/// Built once at start and shared by reference. Other components only read
/// it.
pub struct SessionStore {
    state: watch::Sender<AuthState>,
    backend: Backend,
    limiter: LoginLimiter,
    policy: MembershipPolicy,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ErrorReporter>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(
        backend: Backend,
        storage: Storage,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ErrorReporter>,
        limits: &Limits,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::default());
        let limiter = LoginLimiter::new(
            storage,
            clock.clone(),
            limits.login_attempts,
            Duration::from_secs(limits.login_window_secs),
        );

        Self {
            state,
            backend,
            limiter,
            policy: MembershipPolicy::new(limits.membership_warning_days),
            clock,
            reporter,
        }
    }

    fn dispatch(&self, action: AuthAction) {
        let today = self.clock.today();
        self.state.send_modify(|state| {
            *state = std::mem::take(state).reduce(action, &self.policy, today);
        });
    }

    pub fn snapshot(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn role(&self) -> Role {
        self.state.borrow().role
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.state.borrow().user.clone()
    }

    /// Be notified of every state change.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Membership panel of the current user.
    pub fn membership_info(&self) -> Option<MembershipInfo> {
        self.policy
            .info(self.state.borrow().user.as_ref(), self.clock.today())
    }

    /// Restore an existing session. Always leaves the loading state.
    pub async fn initialize(&self) {
        self.dispatch(AuthAction::LoginStart);

        let action = match self
            .restore()
            .instrument(tracing::info_span!("auth.initialize"))
            .await
        {
            Ok(Some(profile)) => {
                tracing::info!(user_id = %profile.id, role = %profile.role, "session restored");
                AuthAction::LoginSuccess(profile)
            },
            Ok(None) => AuthAction::Logout,
            Err(err) => {
                self.reporter.report(&err, "auth.initialize");
                AuthAction::LoginFailure(err.user_message())
            },
        };

        self.dispatch(action);
    }

    async fn restore(&self) -> Result<Option<UserProfile>> {
        let Some(session) = self.backend.auth.current_session().await? else {
            return Ok(None);
        };

        match self.backend.users.find_by_id(&session.user_id).await? {
            Some(record) => record.try_into_profile(self.clock.now()).map(Some),
            None => {
                tracing::warn!(
                    user_id = %session.user_id,
                    "session has no profile, signing out"
                );
                if let Err(err) = self.backend.auth.sign_out().await {
                    self.reporter.report(&err, "auth.sign_out");
                }
                Ok(None)
            },
        }
    }

    /// Log in with a tax identifier. Returns whether the login succeeded.
    ///
    /// A malformed INN is refused before any network call.
    pub async fn login(&self, inn: &str) -> bool {
        self.dispatch(AuthAction::LoginStart);

        let result = self
            .authenticate(inn.trim())
            .instrument(tracing::info_span!("auth.login", inn = inn.trim()))
            .await;

        match result {
            Ok(profile) => {
                tracing::info!(user_id = %profile.id, role = %profile.role, "login succeeded");
                metrics::counter!("portal_logins_total", "outcome" => "success")
                    .increment(1);
                self.dispatch(AuthAction::LoginSuccess(profile));
                true
            },
            Err(err) => {
                let outcome = if err.is_local() {
                    "refused"
                } else if err.is_service() {
                    self.reporter.report(&err, "auth.login");
                    "error"
                } else {
                    "rejected"
                };
                tracing::info!(outcome, error = %err, "login failed");
                metrics::counter!("portal_logins_total", "outcome" => outcome)
                    .increment(1);
                self.dispatch(AuthAction::LoginFailure(err.user_message()));
                false
            },
        }
    }

    async fn authenticate(&self, inn: &str) -> Result<UserProfile> {
        let inn = Inn::parse(inn)?;
        self.limiter.check(inn.as_str())?;

        let registry = self
            .backend
            .functions
            .verify_inn(&VerifyInnRequest { inn: inn.as_str() })
            .await?;
        if !registry.success {
            let message = registry
                .message
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_REJECTION.to_owned());
            return Err(PortalError::Rejected(message));
        }

        let session = match self.backend.auth.current_session().await? {
            Some(session) => session,
            None => self.backend.auth.sign_in_anonymously().await?,
        };

        let mut member =
            MemberUpsert::from_registry(inn, &registry, self.clock.now());
        if self.backend.users.find_by_id(&session.user_id).await?.is_none() {
            member = member.creating();
        }
        let record = self
            .backend
            .users
            .upsert_member(&session.user_id, &member)
            .await?;

        record.try_into_profile(self.clock.now())
    }

    /// Log out. The local state is reset even if the remote sign-out fails.
    pub async fn logout(&self) {
        if let Err(err) = self.backend.auth.sign_out().await {
            tracing::warn!(error = %err, "remote sign-out failed");
            self.reporter.report(&err, "auth.logout");
        }
        self.dispatch(AuthAction::Logout);
    }

    /// Replace the profile after an out-of-band refresh.
    pub fn update_user(&self, profile: UserProfile) {
        self.dispatch(AuthAction::SetUser(profile));
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.dispatch(AuthAction::SetError(message.into()));
    }

    pub fn clear_error(&self) {
        self.dispatch(AuthAction::ClearError);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeDelta};

    use super::*;
    use crate::clock::FixedClock;
    use crate::error::SERVICE_UNAVAILABLE;
    use crate::membership::MembershipStatus;
    use crate::testing::{FakeBackend, registry_hit, registry_miss};
    use crate::user::UserRecord;

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::at("2026-10-16T10:00:00Z"))
    }

    fn store(backend: &FakeBackend, clock: Arc<FixedClock>) -> SessionStore {
        SessionStore::new(
            backend.backend(),
            Storage::memory(),
            clock,
            backend.reporter(),
            &Limits::default(),
        )
    }

    #[tokio::test]
    async fn test_login_success() {
        let backend = FakeBackend::default();
        backend.set_registry("7707083893", registry_hit("Test Org", "2026-10-26"));
        let store = store(&backend, clock());

        assert!(store.login("7707083893").await);

        let state = store.snapshot();
        assert_eq!(state.role, Role::Member);
        assert_eq!(state.membership_status, Some(MembershipStatus::Expiring));
        assert_eq!(state.error, None);
        assert!(!state.loading);

        let user = state.user.unwrap();
        assert_eq!(user.full_name.as_deref(), Some("Test Org"));
        assert_eq!(
            user.membership_exp,
            NaiveDate::from_ymd_opt(2026, 10, 26)
        );
        assert_eq!(backend.anonymous_sign_ins(), 1);

        let info = store.membership_info().unwrap();
        assert_eq!(info.days_until_expiry, 10);
    }

    #[tokio::test]
    async fn test_malformed_inn_never_reaches_network() {
        let backend = FakeBackend::default();
        let store = store(&backend, clock());

        for inn in ["", "123", "1234567890", "77070838931", "77070838a3"] {
            assert!(!store.login(inn).await);
            let state = store.snapshot();
            assert_eq!(state.role, Role::Guest);
            assert_eq!(
                state.error.as_deref(),
                Some(PortalError::InvalidInn.to_string().as_str())
            );
        }

        assert_eq!(backend.verify_calls(), 0);
        assert!(backend.reported().is_empty());
    }

    #[tokio::test]
    async fn test_registry_rejection() {
        let backend = FakeBackend::default();
        backend.set_registry("0000000000", registry_miss("INN not found"));
        let store = store(&backend, clock());

        assert!(!store.login("0000000000").await);

        let state = store.snapshot();
        assert_eq!(state.role, Role::Guest);
        assert_eq!(state.user, None);
        assert_eq!(state.error.as_deref(), Some("INN not found"));
        assert!(backend.reported().is_empty());
    }

    #[tokio::test]
    async fn test_registry_outage_is_generic() {
        let backend = FakeBackend::default();
        backend.fail_verify(true);
        let store = store(&backend, clock());

        assert!(!store.login("7707083893").await);

        let state = store.snapshot();
        assert_eq!(state.error.as_deref(), Some(SERVICE_UNAVAILABLE));
        assert!(!state.loading);
        assert_eq!(backend.reported(), vec!["auth.login"]);
    }

    #[tokio::test]
    async fn test_login_attempts_are_limited() {
        let backend = FakeBackend::default();
        backend.set_registry("0000000000", registry_miss("INN not found"));
        let clock = clock();
        let store = store(&backend, clock.clone());

        for _ in 0..5 {
            assert!(!store.login("0000000000").await);
        }
        assert!(!store.login("0000000000").await);
        assert_eq!(backend.verify_calls(), 5);
        assert_eq!(
            store.snapshot().error.as_deref(),
            Some("too many login attempts, try again in 15 minutes")
        );

        clock.advance(TimeDelta::minutes(15));
        assert!(!store.login("0000000000").await);
        assert_eq!(backend.verify_calls(), 6);
    }

    #[tokio::test]
    async fn test_logout_resets_even_if_remote_fails() {
        let backend = FakeBackend::default();
        backend.set_registry("7707083893", registry_hit("Test Org", "2027-10-26"));
        let store = store(&backend, clock());
        assert!(store.login("7707083893").await);

        backend.fail_sign_out(true);
        store.logout().await;

        let state = store.snapshot();
        assert_eq!(state.user, None);
        assert_eq!(state.role, Role::Guest);
        assert_eq!(state.membership_status, None);
        assert!(!state.loading);
        assert_eq!(backend.reported(), vec!["auth.logout"]);
    }

    #[tokio::test]
    async fn test_initialize_without_session() {
        let backend = FakeBackend::default();
        let store = store(&backend, clock());
        let mut changes = store.subscribe();

        assert!(store.snapshot().loading);
        store.initialize().await;

        assert!(changes.has_changed().unwrap());
        let state = changes.borrow_and_update().clone();
        assert!(!state.loading);
        assert_eq!(state.role, Role::Guest);
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn test_initialize_restores_profile() {
        let backend = FakeBackend::default();
        backend.set_session("u1");
        backend.insert_user(UserRecord {
            id: Some("u1".into()),
            inn: Some("7707083893".into()),
            role: Some("admin".into()),
            ..Default::default()
        });
        let store = store(&backend, clock());

        store.initialize().await;

        let state = store.snapshot();
        assert_eq!(state.role, Role::Admin);
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn test_admin_login_keeps_role() {
        let backend = FakeBackend::default();
        backend.set_session("u1");
        backend.insert_user(UserRecord {
            id: Some("u1".into()),
            inn: Some("7707083893".into()),
            role: Some("admin".into()),
            ..Default::default()
        });
        backend.set_registry("7707083893", registry_hit("Test Org", "2027-10-26"));
        let store = store(&backend, clock());
        store.initialize().await;

        assert!(store.login("7707083893").await);

        let state = store.snapshot();
        assert_eq!(state.role, Role::Admin);
        assert_eq!(
            state.user.map(|user| user.full_name),
            Some(Some("Test Org".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_initialize_orphan_session_signs_out() {
        let backend = FakeBackend::default();
        backend.set_session("ghost");
        let store = store(&backend, clock());

        store.initialize().await;

        let state = store.snapshot();
        assert_eq!(state.role, Role::Guest);
        assert!(!state.loading);
        assert_eq!(backend.sign_outs(), 1);
        assert!(!backend.has_session());
    }

    #[tokio::test]
    async fn test_initialize_failure_degrades_to_guest() {
        let backend = FakeBackend::default();
        backend.set_session("u1");
        backend.fail_users(true);
        let store = store(&backend, clock());

        store.initialize().await;

        let state = store.snapshot();
        assert!(!state.loading);
        assert_eq!(state.role, Role::Guest);
        assert_eq!(state.error.as_deref(), Some(SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_malformed_profile_is_rejected_at_boundary() {
        let backend = FakeBackend::default();
        backend.set_session("u1");
        backend.insert_user(UserRecord {
            id: Some("u1".into()),
            inn: Some("not-an-inn".into()),
            ..Default::default()
        });
        let store = store(&backend, clock());

        store.initialize().await;

        let state = store.snapshot();
        assert_eq!(state.user, None);
        assert_eq!(state.error.as_deref(), Some(SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_update_user_and_errors() {
        let backend = FakeBackend::default();
        let clock = clock();
        let store = store(&backend, clock.clone());
        store.initialize().await;

        let mut profile =
            UserProfile::new("u1", "7707083893", Role::Member, clock.now());
        profile.membership_exp = NaiveDate::from_ymd_opt(2026, 10, 1);
        store.update_user(profile);
        assert_eq!(store.role(), Role::Member);
        assert_eq!(
            store.snapshot().membership_status,
            Some(MembershipStatus::Expired)
        );

        store.set_error("Profile could not be saved.");
        assert_eq!(store.user().map(|user| user.id), Some("u1".to_owned()));
        store.clear_error();
        assert_eq!(store.snapshot().error, None);
    }
}
