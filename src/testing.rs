//! In-memory backend used by unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::auth::SessionStore;
use crate::backend::{
    AuthGateway, AuthSession, Backend, ChatRepository, DocumentRepository,
    EdgeFunctions, ObjectStorage, UserDirectory,
};
use crate::chat::{
    AskRequest, AskResponse, ChatMessageRecord, ChatSessionRecord, NewChatMessage,
};
use crate::clock::{Clock, FixedClock};
use crate::config::Limits;
use crate::documents::{Document, DocumentPage, DocumentQuery};
use crate::error::{PortalError, Result};
use crate::storage::Storage;
use crate::support::{TicketRequest, TicketResponse};
use crate::telemetry::ErrorReporter;
use crate::user::{
    MemberUpsert, RegistryVerification, Role, UserProfile, UserRecord,
    VerifyInnRequest,
};

fn outage() -> PortalError {
    PortalError::Backend {
        status: 503,
        message: "service unavailable".into(),
    }
}

/// Catalog entry `doc-{i}`.
pub fn document(i: usize, is_public: bool) -> Document {
    Document {
        id: format!("doc-{i}"),
        title: format!("Doc-{i} regulation"),
        file_path: format!("doc-{i}.pdf"),
        file_size: Some(1024 * (i as u64 + 1)),
        mime_type: Some("application/pdf".into()),
        is_public,
        created_at: None,
        updated_at: None,
    }
}

/// Registry answer of a current member.
pub fn registry_hit(full_name: &str, expiration: &str) -> RegistryVerification {
    RegistryVerification {
        success: true,
        full_name: Some(full_name.into()),
        membership_status: Some("active".into()),
        membership_expiration_date: Some(expiration.into()),
        message: None,
    }
}

/// Registry refusal.
pub fn registry_miss(message: &str) -> RegistryVerification {
    RegistryVerification {
        success: false,
        message: Some(message.into()),
        ..Default::default()
    }
}

/// Session store whose actor has `role`.
pub fn test_session(backend: &FakeBackend, role: Role) -> Arc<SessionStore> {
    let clock = Arc::new(FixedClock::at("2026-10-16T10:00:00Z"));
    let now = clock.now();
    let store = SessionStore::new(
        backend.backend(),
        Storage::memory(),
        clock,
        backend.reporter(),
        &Limits::default(),
    );

    if role != Role::Guest {
        store.update_user(UserProfile::new(
            format!("user-{role}"),
            "7707083893",
            role,
            now,
        ));
    }
    Arc::new(store)
}

/// Records every reported operation.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    operations: Mutex<Vec<&'static str>>,
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, _error: &PortalError, operation: &'static str) {
        self.operations.lock().unwrap().push(operation);
    }
}

#[derive(Debug, Default)]
struct State {
    session: Option<AuthSession>,
    anonymous_sign_ins: usize,
    sign_outs: usize,
    fail_sign_out: bool,

    users: HashMap<String, UserRecord>,
    fail_users: bool,

    registry: HashMap<String, RegistryVerification>,
    verify_calls: usize,
    fail_verify: bool,

    documents: Vec<Document>,
    document_queries: Vec<DocumentQuery>,
    fail_documents: bool,
    documents_delay: Duration,

    chat_sessions: Vec<ChatSessionRecord>,
    chat_messages: Vec<ChatMessageRecord>,
    ask_requests: Vec<AskRequest>,
    fail_answers: bool,
    answers_delay: Duration,

    uploads: Vec<(String, String)>,
    fail_uploads: bool,
    ticket_requests: Vec<TicketRequest>,
    ticket_refusal: Option<String>,
    fail_tickets: bool,
    tickets_delay: Duration,
}

/// Fake implementing every backend port.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<State>>,
    reporter: Arc<RecordingReporter>,
}

impl FakeBackend {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn backend(&self) -> Backend {
        let port = Arc::new(self.clone());
        Backend {
            auth: port.clone(),
            users: port.clone(),
            documents: port.clone(),
            chat: port.clone(),
            objects: port.clone(),
            functions: port,
        }
    }

    pub fn documents(&self) -> Arc<dyn DocumentRepository> {
        Arc::new(self.clone())
    }

    pub fn reporter(&self) -> Arc<dyn ErrorReporter> {
        self.reporter.clone()
    }

    pub fn reported(&self) -> Vec<&'static str> {
        self.reporter.operations.lock().unwrap().clone()
    }

    // Auth.

    pub fn set_session(&self, user_id: &str) {
        self.state().session = Some(AuthSession {
            access_token: format!("token-{user_id}"),
            refresh_token: "refresh".into(),
            user_id: user_id.into(),
        });
    }

    pub fn has_session(&self) -> bool {
        self.state().session.is_some()
    }

    pub fn anonymous_sign_ins(&self) -> usize {
        self.state().anonymous_sign_ins
    }

    pub fn sign_outs(&self) -> usize {
        self.state().sign_outs
    }

    pub fn fail_sign_out(&self, fail: bool) {
        self.state().fail_sign_out = fail;
    }

    // Users.

    pub fn insert_user(&self, record: UserRecord) {
        let id = record.id.clone().unwrap_or_default();
        self.state().users.insert(id, record);
    }

    pub fn fail_users(&self, fail: bool) {
        self.state().fail_users = fail;
    }

    // Registry.

    pub fn set_registry(&self, inn: &str, verification: RegistryVerification) {
        self.state().registry.insert(inn.into(), verification);
    }

    pub fn verify_calls(&self) -> usize {
        self.state().verify_calls
    }

    pub fn fail_verify(&self, fail: bool) {
        self.state().fail_verify = fail;
    }

    // Documents.

    /// Add `count` documents, every other one public.
    pub fn add_documents(&self, count: usize) {
        let mut state = self.state();
        let start = state.documents.len();
        state
            .documents
            .extend((start..start + count).map(|i| document(i, i % 2 == 0)));
    }

    pub fn document_queries(&self) -> Vec<DocumentQuery> {
        self.state().document_queries.clone()
    }

    pub fn fail_documents(&self, fail: bool) {
        self.state().fail_documents = fail;
    }

    pub fn delay_documents(&self, delay: Duration) {
        self.state().documents_delay = delay;
    }

    // Chat.

    pub fn ask_requests(&self) -> Vec<AskRequest> {
        self.state().ask_requests.clone()
    }

    pub fn fail_answers(&self, fail: bool) {
        self.state().fail_answers = fail;
    }

    pub fn delay_answers(&self, delay: Duration) {
        self.state().answers_delay = delay;
    }

    /// Number of chat sessions created.
    pub fn chat_sessions(&self) -> usize {
        self.state().chat_sessions.len()
    }

    pub fn chat_messages(&self) -> Vec<ChatMessageRecord> {
        self.state().chat_messages.clone()
    }

    // Support.

    /// Uploaded `(bucket, path)` pairs.
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.state().uploads.clone()
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.state().fail_uploads = fail;
    }

    pub fn ticket_requests(&self) -> Vec<TicketRequest> {
        self.state().ticket_requests.clone()
    }

    /// Answer `success: false` with `message`, or accept tickets again.
    pub fn refuse_tickets(&self, message: Option<&str>) {
        self.state().ticket_refusal = message.map(str::to_owned);
    }

    pub fn fail_tickets(&self, fail: bool) {
        self.state().fail_tickets = fail;
    }

    pub fn delay_tickets(&self, delay: Duration) {
        self.state().tickets_delay = delay;
    }
}

#[async_trait]
impl AuthGateway for FakeBackend {
    async fn current_session(&self) -> Result<Option<AuthSession>> {
        Ok(self.state().session.clone())
    }

    async fn sign_in_anonymously(&self) -> Result<AuthSession> {
        let mut state = self.state();
        state.anonymous_sign_ins += 1;
        let session = AuthSession {
            access_token: format!("anon-token-{}", state.anonymous_sign_ins),
            refresh_token: "refresh".into(),
            user_id: format!("anon-{}", state.anonymous_sign_ins),
        };
        state.session = Some(session.clone());
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        let mut state = self.state();
        state.sign_outs += 1;
        state.session = None;
        if state.fail_sign_out {
            return Err(outage());
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for FakeBackend {
    async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>> {
        let state = self.state();
        if state.fail_users {
            return Err(outage());
        }
        Ok(state.users.get(id).cloned())
    }

    async fn upsert_member(
        &self,
        id: &str,
        member: &MemberUpsert,
    ) -> Result<UserRecord> {
        let mut state = self.state();
        if state.fail_users {
            return Err(outage());
        }

        let existing = state.users.get(id);
        let created_at = existing
            .and_then(|record| record.created_at.clone())
            .unwrap_or_else(|| member.updated_at.to_rfc3339());
        let role = match member.role {
            Some(role) => Some(role.as_str().to_owned()),
            None => existing.and_then(|record| record.role.clone()),
        };
        let record = UserRecord {
            id: Some(id.into()),
            inn: Some(member.inn.as_str().into()),
            full_name: member.full_name.clone(),
            role,
            membership_exp: member.membership_exp.map(|date| date.to_string()),
            membership_status: member.membership_status.clone(),
            recovery_email: None,
            created_at: Some(created_at),
            updated_at: Some(member.updated_at.to_rfc3339()),
        };
        state.users.insert(id.into(), record.clone());
        Ok(record)
    }
}

#[async_trait]
impl DocumentRepository for FakeBackend {
    async fn query(&self, query: &DocumentQuery) -> Result<DocumentPage> {
        let delay = {
            let mut state = self.state();
            state.document_queries.push(query.clone());
            state.documents_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.state();
        if state.fail_documents {
            return Err(outage());
        }

        let search = query.search.to_lowercase();
        let matching: Vec<&Document> = state
            .documents
            .iter()
            .filter(|doc| !query.public_only() || doc.is_public)
            .filter(|doc| doc.title.to_lowercase().contains(&search))
            .collect();
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();

        Ok(DocumentPage::new(items, Some(total), query.offset, query.limit))
    }

    async fn signed_url(&self, path: &str, expires_in: u64) -> Result<String> {
        Ok(format!("https://files.test/signed/{path}?expires={expires_in}"))
    }

    fn public_url(&self, path: &str) -> String {
        format!("https://files.test/public/{path}")
    }
}

#[async_trait]
impl ChatRepository for FakeBackend {
    async fn create_session(&self, user_id: &str) -> Result<ChatSessionRecord> {
        let mut state = self.state();
        let now = Utc::now();
        let session = ChatSessionRecord {
            id: format!("session-{}", state.chat_sessions.len() + 1),
            user_id: user_id.into(),
            title: None,
            created_at: Some(now),
            updated_at: Some(now),
        };
        state.chat_sessions.push(session.clone());
        Ok(session)
    }

    async fn latest_session(
        &self,
        user_id: &str,
    ) -> Result<Option<ChatSessionRecord>> {
        Ok(self
            .state()
            .chat_sessions
            .iter()
            .rev()
            .find(|session| session.user_id == user_id)
            .cloned())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessageRecord>> {
        Ok(self
            .state()
            .chat_messages
            .iter()
            .filter(|message| message.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn append(&self, message: &NewChatMessage) -> Result<ChatMessageRecord> {
        let mut state = self.state();
        let record = ChatMessageRecord {
            id: format!("msg-{}", state.chat_messages.len() + 1),
            session_id: message.session_id.clone(),
            role: message.role,
            content: message.content.clone(),
            created_at: Some(Utc::now()),
        };
        state.chat_messages.push(record.clone());
        Ok(record)
    }
}

#[async_trait]
impl ObjectStorage for FakeBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        _bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String> {
        let mut state = self.state();
        if state.fail_uploads {
            return Err(outage());
        }
        state.uploads.push((bucket.into(), path.into()));
        Ok(path.into())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("https://files.test/{bucket}/{path}")
    }
}

#[async_trait]
impl EdgeFunctions for FakeBackend {
    async fn verify_inn(
        &self,
        request: &VerifyInnRequest<'_>,
    ) -> Result<RegistryVerification> {
        let mut state = self.state();
        state.verify_calls += 1;
        if state.fail_verify {
            return Err(outage());
        }
        Ok(state
            .registry
            .get(request.inn)
            .cloned()
            .unwrap_or_default())
    }

    async fn ask(&self, request: &AskRequest) -> Result<AskResponse> {
        let (delay, fail) = {
            let mut state = self.state();
            state.ask_requests.push(request.clone());
            (state.answers_delay, state.fail_answers)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(outage());
        }

        Ok(AskResponse {
            success: true,
            answer: Some(format!("Answer to: {}", request.question)),
            session_id: request.session_id.clone(),
            message: None,
        })
    }

    async fn report_issue(&self, request: &TicketRequest) -> Result<TicketResponse> {
        let delay = self.state().tickets_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_tickets {
            return Err(outage());
        }
        state.ticket_requests.push(request.clone());

        Ok(match &state.ticket_refusal {
            Some(message) => TicketResponse {
                success: false,
                ticket_id: None,
                message: Some(message.clone()),
            },
            None => TicketResponse {
                success: true,
                ticket_id: Some(format!("ticket-{}", state.ticket_requests.len())),
                message: None,
            },
        })
    }
}
