//! AI consultant chat.
//!
//! Guests keep a bounded transcript on the device and are limited to a few
//! questions per day. Members have a remote session created on first send.

mod quota;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

pub use quota::GuestQuota;

use crate::auth::SessionStore;
use crate::backend::{Backend, ChatRepository, EdgeFunctions};
use crate::clock::Clock;
use crate::config::Limits;
use crate::error::{PortalError, Result};
use crate::storage::{Storage, keys};
use crate::telemetry::ErrorReporter;
use crate::user::Role;

/// Shown when the answer endpoint fails without a reason.
const DEFAULT_ANSWER_ERROR: &str = "The consultant could not answer, please try again.";

/// Author of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// One turn of the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatHistoryItem {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatHistoryItem {
    fn local(role: ChatRole, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: format!(
                "{}-{}-{}",
                now.timestamp_millis(),
                role.as_str(),
                Alphanumeric.sample_string(&mut OsRng, 6)
            ),
            role,
            content: content.into(),
            created_at: now,
        }
    }
}

/// Guest turn as stored on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl From<&ChatHistoryItem> for GuestChatMessage {
    fn from(item: &ChatHistoryItem) -> Self {
        Self {
            role: item.role,
            content: item.content.clone(),
            timestamp: item.created_at.timestamp_millis(),
        }
    }
}

impl From<GuestChatMessage> for ChatHistoryItem {
    fn from(message: GuestChatMessage) -> Self {
        let created_at =
            DateTime::from_timestamp_millis(message.timestamp).unwrap_or_default();
        Self::local(message.role, message.content, created_at)
    }
}

/// Row of `chat_sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSessionRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Row of `chat_messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    pub id: String,
    pub session_id: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl ChatMessageRecord {
    fn into_item(self, now: DateTime<Utc>) -> ChatHistoryItem {
        ChatHistoryItem {
            id: self.id,
            role: self.role,
            content: self.content,
            created_at: self.created_at.unwrap_or(now),
        }
    }
}

/// Insert payload of `chat_messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewChatMessage {
    pub session_id: String,
    pub role: ChatRole,
    pub content: String,
}

/// Context turn sent along with a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

/// Request body of the answer endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ChatTurn>,
}

/// Answer endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AskResponse {
    pub success: bool,
    pub answer: Option<String>,
    pub session_id: Option<String>,
    pub message: Option<String>,
}

/// Observable state of a [`ChatSession`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    pub messages: Vec<ChatHistoryItem>,
    /// A question is waiting for its answer.
    pub loading: bool,
    pub history_loading: bool,
    pub error: Option<String>,
    pub is_limit_exceeded: bool,
    /// Questions left today, guests only.
    pub questions_left: Option<u32>,
    /// Remote session of a member.
    pub session_id: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    state: ChatState,
    disposed: bool,
}

/// Message transcript with quota enforcement.
pub struct ChatSession {
    repository: Arc<dyn ChatRepository>,
    functions: Arc<dyn EdgeFunctions>,
    session: Arc<SessionStore>,
    storage: Storage,
    quota: GuestQuota,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ErrorReporter>,
    guest_question_length: usize,
    member_question_length: usize,
    history_size: usize,
    inner: Mutex<Inner>,
}

impl ChatSession {
    pub fn new(
        backend: &Backend,
        session: Arc<SessionStore>,
        storage: Storage,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ErrorReporter>,
        limits: &Limits,
    ) -> Self {
        Self {
            repository: backend.chat.clone(),
            functions: backend.functions.clone(),
            session,
            quota: GuestQuota::new(storage.clone(), limits.guest_daily_questions),
            storage,
            clock,
            reporter,
            guest_question_length: limits.guest_question_length,
            member_question_length: limits.member_question_length,
            history_size: limits.guest_history_size.max(1),
            inner: Mutex::default(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ChatState {
        self.inner().state.clone()
    }

    /// Longest question accepted for `role`.
    pub fn max_question_length(&self, role: Role) -> usize {
        match role {
            Role::Guest => self.guest_question_length,
            Role::Member | Role::Admin => self.member_question_length,
        }
    }

    /// Stop applying responses to the state.
    pub fn dispose(&self) {
        self.inner().disposed = true;
    }

    pub fn clear_error(&self) {
        self.inner().state.error = None;
    }

    /// Restore the transcript of the current actor.
    pub async fn load_history(&self) {
        if self.session.role() == Role::Guest {
            self.load_guest_history();
            return;
        }

        {
            let mut inner = self.inner();
            if inner.disposed {
                return;
            }
            inner.state.history_loading = true;
            inner.state.error = None;
            inner.state.is_limit_exceeded = false;
            inner.state.questions_left = None;
        }

        let result = self.fetch_member_history().await;

        let mut inner = self.inner();
        if inner.disposed {
            return;
        }
        match result {
            Ok((session_id, messages)) => {
                inner.state.session_id = session_id;
                inner.state.messages = messages;
            },
            Err(err) => {
                self.reporter.report(&err, "chat.load_history");
                inner.state.error = Some(err.user_message());
            },
        }
        inner.state.history_loading = false;
    }

    fn load_guest_history(&self) {
        let stored: Vec<GuestChatMessage> =
            self.storage.get(keys::GUEST_CHAT_HISTORY, Vec::new());
        let skip = stored.len().saturating_sub(self.history_size);
        let messages = stored.into_iter().skip(skip).map(Into::into).collect();
        let today = self.clock.today();

        let mut inner = self.inner();
        if inner.disposed {
            return;
        }
        inner.state.messages = messages;
        inner.state.session_id = None;
        inner.state.questions_left = Some(self.quota.remaining(today));
        inner.state.is_limit_exceeded = self.quota.is_exceeded(today);
    }

    async fn fetch_member_history(
        &self,
    ) -> Result<(Option<String>, Vec<ChatHistoryItem>)> {
        let user = self.session.user().ok_or(PortalError::NotAuthenticated)?;
        let Some(session) = self.repository.latest_session(&user.id).await? else {
            return Ok((None, Vec::new()));
        };

        let now = self.clock.now();
        let messages = self
            .repository
            .messages(&session.id)
            .await?
            .into_iter()
            .map(|record| record.into_item(now))
            .collect();

        Ok((Some(session.id), messages))
    }

    /// Ask a question. Returns whether an answer was appended.
    ///
    /// Blank text, an in-flight question or an exhausted guest quota make
    /// this a no-op without any network call.
    pub async fn send_message(&self, text: &str) -> bool {
        let question = text.trim();
        let role = self.session.role();
        let today = self.clock.today();

        let history = {
            let mut inner = self.inner();
            if inner.disposed || question.is_empty() || inner.state.loading {
                return false;
            }

            if role == Role::Guest && self.quota.is_exceeded(today) {
                let err = PortalError::QuotaExceeded {
                    limit: self.quota.limit(),
                };
                inner.state.is_limit_exceeded = true;
                inner.state.questions_left = Some(0);
                inner.state.error = Some(err.user_message());
                return false;
            }
            if role != Role::Guest {
                inner.state.is_limit_exceeded = false;
                inner.state.questions_left = None;
            }

            let max = self.max_question_length(role);
            if question.chars().count() > max {
                inner.state.error =
                    Some(PortalError::MessageTooLong { max }.user_message());
                return false;
            }

            let skip = inner.state.messages.len().saturating_sub(self.history_size);
            let history: Vec<ChatTurn> = inner.state.messages[skip..]
                .iter()
                .map(|item| ChatTurn {
                    role: item.role,
                    content: item.content.clone(),
                })
                .collect();

            inner.state.messages.push(ChatHistoryItem::local(
                ChatRole::User,
                question,
                self.clock.now(),
            ));
            inner.state.loading = true;
            inner.state.error = None;
            history
        };

        let started = Instant::now();
        let result = self.ask(role, question, history).await;
        metrics::histogram!("portal_answer_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok((session_id, answer)) => {
                metrics::counter!(
                    "portal_questions_total",
                    "role" => role.as_str(),
                    "outcome" => "answered"
                )
                .increment(1);
                self.on_answer(role, question, session_id, answer).await
            },
            Err(err) => {
                metrics::counter!(
                    "portal_questions_total",
                    "role" => role.as_str(),
                    "outcome" => "failed"
                )
                .increment(1);
                if err.is_service() {
                    self.reporter.report(&err, "chat.send_message");
                }

                // The question stays in the transcript for resubmission.
                let mut inner = self.inner();
                if !inner.disposed {
                    inner.state.error = Some(err.user_message());
                    inner.state.loading = false;
                }
                false
            },
        }
    }

    /// Call the answer endpoint, creating the member session if needed.
    async fn ask(
        &self,
        role: Role,
        question: &str,
        history: Vec<ChatTurn>,
    ) -> Result<(Option<String>, String)> {
        let (guest_id, session_id) = if role == Role::Guest {
            (Some(self.storage.guest_id()), None)
        } else {
            (None, Some(self.ensure_session().await?))
        };

        let response = self
            .functions
            .ask(&AskRequest {
                question: question.to_owned(),
                guest_id,
                session_id: session_id.clone(),
                history,
            })
            .await?;

        match response.answer {
            Some(answer) if response.success => {
                Ok((session_id.or(response.session_id), answer))
            },
            _ => Err(PortalError::Rejected(
                response
                    .message
                    .unwrap_or_else(|| DEFAULT_ANSWER_ERROR.to_owned()),
            )),
        }
    }

    async fn ensure_session(&self) -> Result<String> {
        let existing = self.inner().state.session_id.clone();
        if let Some(id) = existing {
            return Ok(id);
        }

        let user = self.session.user().ok_or(PortalError::NotAuthenticated)?;
        let session = self.repository.create_session(&user.id).await?;
        tracing::debug!(session_id = %session.id, "chat session created");

        let mut inner = self.inner();
        if !inner.disposed {
            inner.state.session_id = Some(session.id.clone());
        }
        Ok(session.id)
    }

    async fn on_answer(
        &self,
        role: Role,
        question: &str,
        session_id: Option<String>,
        answer: String,
    ) -> bool {
        let today = self.clock.today();

        let transcript = {
            let mut inner = self.inner();
            if inner.disposed {
                return false;
            }

            inner.state.messages.push(ChatHistoryItem::local(
                ChatRole::Assistant,
                answer.clone(),
                self.clock.now(),
            ));
            inner.state.loading = false;

            if role == Role::Guest {
                let left = self.quota.record(today);
                inner.state.questions_left = Some(left);
                inner.state.is_limit_exceeded = left == 0;
            } else if inner.state.session_id.is_none() {
                inner.state.session_id = session_id.clone();
            }

            let skip = inner.state.messages.len().saturating_sub(self.history_size);
            inner.state.messages[skip..]
                .iter()
                .map(GuestChatMessage::from)
                .collect::<Vec<_>>()
        };

        match (role, session_id) {
            (Role::Guest, _) => {
                self.storage.set(keys::GUEST_CHAT_HISTORY, &transcript);
            },
            (_, Some(session_id)) => {
                if let Err(err) = self.persist_turn(&session_id, question, answer).await {
                    tracing::warn!(%session_id, error = %err, "cannot save chat turn");
                    self.reporter.report(&err, "chat.persist_turn");
                }
            },
            (_, None) => {},
        }

        true
    }

    async fn persist_turn(
        &self,
        session_id: &str,
        question: &str,
        answer: String,
    ) -> Result<()> {
        for (role, content) in
            [(ChatRole::User, question.to_owned()), (ChatRole::Assistant, answer)]
        {
            self.repository
                .append(&NewChatMessage {
                    session_id: session_id.to_owned(),
                    role,
                    content,
                })
                .await?;
        }
        Ok(())
    }
}
