//! These traits define what the portal needs from the backend.

pub mod supabase;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chat::{
    AskRequest, AskResponse, ChatMessageRecord, ChatSessionRecord,
    NewChatMessage,
};
use crate::documents::{DocumentPage, DocumentQuery};
use crate::error::Result;
use crate::support::{TicketRequest, TicketResponse};
use crate::user::{
    MemberUpsert, RegistryVerification, UserRecord, VerifyInnRequest,
};

pub use supabase::SupabaseClient;

/// Authenticated backend session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
}

/// Port for the authentication service.
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Restore the persisted session, `None` when there is none or it
    /// cannot be refreshed.
    async fn current_session(&self) -> Result<Option<AuthSession>>;

    /// Open an anonymous session to attach a member profile to.
    async fn sign_in_anonymously(&self) -> Result<AuthSession>;

    /// Revoke the remote session. The local copy is always dropped.
    async fn sign_out(&self) -> Result<()>;
}

/// Port for the `users` table.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Find a user by its identifier.
    async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>>;

    /// Create or update a member row keyed by user identifier.
    async fn upsert_member(
        &self,
        id: &str,
        member: &MemberUpsert,
    ) -> Result<UserRecord>;
}

/// Port for the `documents` table and file storage.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Fetch one page of documents.
    async fn query(&self, query: &DocumentQuery) -> Result<DocumentPage>;

    /// Create a time-limited download link.
    async fn signed_url(&self, path: &str, expires_in: u64) -> Result<String>;

    /// Permanent link of a public file.
    fn public_url(&self, path: &str) -> String;
}

/// Port for member chat persistence.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn create_session(&self, user_id: &str) -> Result<ChatSessionRecord>;

    /// Most recently updated session of `user_id`.
    async fn latest_session(
        &self,
        user_id: &str,
    ) -> Result<Option<ChatSessionRecord>>;

    /// Messages of a session ordered by creation time, oldest first.
    async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessageRecord>>;

    async fn append(&self, message: &NewChatMessage) -> Result<ChatMessageRecord>;
}

/// Port for object storage.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload `bytes`, returning the stored path.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Port for the server-side functions.
///
/// A function answering a well-formed refusal (`success: false`) returns
/// `Ok`. Only transport and server failures are `Err`.
#[async_trait]
pub trait EdgeFunctions: Send + Sync {
    async fn verify_inn(
        &self,
        request: &VerifyInnRequest<'_>,
    ) -> Result<RegistryVerification>;

    async fn ask(&self, request: &AskRequest) -> Result<AskResponse>;

    async fn report_issue(&self, request: &TicketRequest) -> Result<TicketResponse>;
}

/// Shared handle over every backend port.
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthGateway>,
    pub users: Arc<dyn UserDirectory>,
    pub documents: Arc<dyn DocumentRepository>,
    pub chat: Arc<dyn ChatRepository>,
    pub objects: Arc<dyn ObjectStorage>,
    pub functions: Arc<dyn EdgeFunctions>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

impl Backend {
    /// Route every port to one [`SupabaseClient`].
    pub fn supabase(client: Arc<SupabaseClient>) -> Self {
        Self {
            auth: client.clone(),
            users: client.clone(),
            documents: client.clone(),
            chat: client.clone(),
            objects: client.clone(),
            functions: client,
        }
    }
}
