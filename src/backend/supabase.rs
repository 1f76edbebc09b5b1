//! HTTP adapter speaking the Supabase REST dialect.
//!
//! Every port of [`crate::backend`] is implemented on one [`SupabaseClient`]:
//! GoTrue for authentication, PostgREST for tables, Storage for files and
//! Edge Functions for the remote collaborators.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    AuthGateway, AuthSession, ChatRepository, DocumentRepository,
    EdgeFunctions, ObjectStorage, UserDirectory,
};
use crate::chat::{
    AskRequest, AskResponse, ChatMessageRecord, ChatSessionRecord,
    NewChatMessage,
};
use crate::config::Supabase as Settings;
use crate::documents::{Document, DocumentPage, DocumentQuery};
use crate::error::{PortalError, Result, ToInternal};
use crate::storage::{Storage, keys};
use crate::support::{TicketRequest, TicketResponse};
use crate::user::{
    MemberUpsert, RegistryVerification, UserRecord, VerifyInnRequest,
};

const USER_AGENT: &str = concat!("sro-portal/", env!("CARGO_PKG_VERSION"));
const PREFER: &str = "Prefer";
const RETURN_REPRESENTATION: &str = "return=representation";
/// Longest backend error body kept in a message.
const MAX_ERROR_LENGTH: usize = 200;

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    user: GoTrueUser,
}

impl From<TokenResponse> for AuthSession {
    fn from(token: TokenResponse) -> Self {
        Self {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            user_id: token.user.id,
        }
    }
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
struct UserRow<'a> {
    id: &'a str,
    #[serde(flatten)]
    member: &'a MemberUpsert,
}

#[derive(Debug, Serialize)]
struct NewChatSession<'a> {
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest {
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

/// Client of one Supabase project.
pub struct SupabaseClient {
    http: reqwest::Client,
    base: Url,
    anon_key: String,
    documents_bucket: String,
    storage: Storage,
    session: Mutex<Option<AuthSession>>,
}

impl std::fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl SupabaseClient {
    /// Create a new [`SupabaseClient`], restoring a persisted session from
    /// `storage`.
    pub fn new(settings: &Settings, storage: Storage) -> Result<Self> {
        let mut base = Url::parse(&settings.url).catch()?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        let session: Option<AuthSession> =
            storage.get(keys::AUTH_SESSION, None);

        Ok(Self {
            http,
            base,
            anon_key: settings.anon_key.clone(),
            documents_bucket: settings.documents_bucket.clone(),
            storage,
            session: Mutex::new(session),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base.join(path).catch()
    }

    fn session(&self) -> Option<AuthSession> {
        self.session.lock().ok().and_then(|session| session.clone())
    }

    fn set_session(&self, session: Option<AuthSession>) {
        match &session {
            Some(session) => self.storage.set(keys::AUTH_SESSION, session),
            None => self.storage.remove(keys::AUTH_SESSION),
        }
        if let Ok(mut current) = self.session.lock() {
            *current = session;
        }
    }

    /// Request authenticated with the session token, or the anonymous key.
    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self
            .session()
            .map(|session| session.access_token)
            .unwrap_or_else(|| self.anon_key.clone());

        Ok(self
            .http
            .request(method, self.endpoint(path)?)
            .header("apikey", &self.anon_key)
            .bearer_auth(token))
    }

    /// Turn a non-2xx response into [`PortalError::Backend`].
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(PortalError::Backend {
            status: status.as_u16(),
            message: error_message(&body),
        })
    }

    async fn rows<T: DeserializeOwned>(request: RequestBuilder) -> Result<Vec<T>> {
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn single<T: DeserializeOwned>(
        request: RequestBuilder,
        table: &'static str,
    ) -> Result<T> {
        Self::rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PortalError::MalformedRecord {
                table,
                details: "no row returned".into(),
            })
    }

    async fn exchange_token(
        &self,
        grant: &str,
        body: &impl Serialize,
    ) -> Result<AuthSession> {
        let request = self
            .http
            .post(self.endpoint(grant)?)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
            .json(body);
        let response = Self::check(request.send().await?).await?;
        let session: AuthSession = response.json::<TokenResponse>().await?.into();

        self.set_session(Some(session.clone()));
        Ok(session)
    }

    /// Invoke an edge function.
    async fn invoke<B, T>(&self, name: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::POST, &format!("functions/v1/{name}"))?
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&text).catch();
        }
        // Refusals come back as client errors with a regular body.
        if matches!(
            status,
            StatusCode::BAD_REQUEST
                | StatusCode::UNPROCESSABLE_ENTITY
                | StatusCode::TOO_MANY_REQUESTS
        ) {
            if let Ok(body) = serde_json::from_str(&text) {
                return Ok(body);
            }
        }

        Err(PortalError::Backend {
            status: status.as_u16(),
            message: error_message(&text),
        })
    }

    fn storage_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}storage/v1/object/public/{bucket}/{}",
            self.base,
            path.trim_start_matches('/')
        )
    }
}

/// Extract a readable message from a backend error body.
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(alias = "msg", alias = "error_description", alias = "error")]
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(error) => error.message,
        Err(_) => body.chars().take(MAX_ERROR_LENGTH).collect(),
    }
}

/// Total row count from a PostgREST `Content-Range` header, such as
/// `0-19/57` or `*/0`.
pub fn parse_content_range(header: Option<&HeaderValue>) -> Option<u64> {
    header?
        .to_str()
        .ok()?
        .rsplit_once('/')
        .and_then(|(_, total)| total.parse().ok())
}

/// PostgREST `ilike` filter matching `term` as a literal substring.
///
/// Wildcards are escaped for `LIKE` and the value is double-quoted so
/// reserved characters such as `,` and `()` survive.
fn ilike_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 8);
    for c in term.trim().chars() {
        match c {
            // Always a wildcard for PostgREST, keep it to a single character.
            '*' => pattern.push('_'),
            '%' | '_' => {
                pattern.push_str("\\\\");
                pattern.push(c);
            },
            '\\' => pattern.push_str("\\\\\\\\"),
            '"' => pattern.push_str("\\\""),
            c => pattern.push(c),
        }
    }
    format!("ilike.\"*{pattern}*\"")
}

#[async_trait]
impl AuthGateway for SupabaseClient {
    async fn current_session(&self) -> Result<Option<AuthSession>> {
        let Some(session) = self.session() else {
            return Ok(None);
        };

        let response = self.request(Method::GET, "auth/v1/user")?.send().await?;
        match response.status() {
            status if status.is_success() => {
                let user: GoTrueUser = response.json().await?;
                Ok(Some(AuthSession {
                    user_id: user.id,
                    ..session
                }))
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let refreshed = self
                    .exchange_token(
                        "auth/v1/token?grant_type=refresh_token",
                        &RefreshRequest {
                            refresh_token: &session.refresh_token,
                        },
                    )
                    .await;

                match refreshed {
                    Ok(session) => Ok(Some(session)),
                    Err(err) => {
                        tracing::warn!(error = %err, "cannot refresh session, dropping it");
                        self.set_session(None);
                        Ok(None)
                    },
                }
            },
            _ => {
                Self::check(response).await?;
                Err(PortalError::internal("unexpected session response"))
            },
        }
    }

    async fn sign_in_anonymously(&self) -> Result<AuthSession> {
        self.exchange_token("auth/v1/signup", &serde_json::json!({}))
            .await
    }

    async fn sign_out(&self) -> Result<()> {
        if self.session().is_none() {
            return Ok(());
        }

        let result = match self.request(Method::POST, "auth/v1/logout") {
            Ok(request) => match request.send().await {
                Ok(response) => Self::check(response).await.map(|_| ()),
                Err(err) => Err(err.into()),
            },
            Err(err) => Err(err),
        };

        self.set_session(None);
        result
    }
}

#[async_trait]
impl UserDirectory for SupabaseClient {
    async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>> {
        let filter = format!("eq.{id}");
        let request = self
            .request(Method::GET, "rest/v1/users")?
            .query(&[("select", "*"), ("id", filter.as_str())]);

        Ok(Self::rows(request).await?.into_iter().next())
    }

    async fn upsert_member(
        &self,
        id: &str,
        member: &MemberUpsert,
    ) -> Result<UserRecord> {
        let request = self
            .request(Method::POST, "rest/v1/users")?
            .query(&[("on_conflict", "id")])
            .header(
                PREFER,
                format!("resolution=merge-duplicates,{RETURN_REPRESENTATION}"),
            )
            .json(&UserRow { id, member });

        Self::single(request, "users").await
    }
}

#[async_trait]
impl DocumentRepository for SupabaseClient {
    async fn query(&self, query: &DocumentQuery) -> Result<DocumentPage> {
        let mut params = vec![
            ("select", "*".to_owned()),
            ("order", query.sort.order().to_owned()),
            ("offset", query.offset.to_string()),
            ("limit", query.limit.to_string()),
        ];
        if query.public_only() {
            params.push(("is_public", "eq.true".to_owned()));
        }
        if !query.search.trim().is_empty() {
            params.push(("title", ilike_pattern(&query.search)));
        }

        let request = self
            .request(Method::GET, "rest/v1/documents")?
            .query(&params)
            .header(PREFER, "count=exact");
        let response = Self::check(request.send().await?).await?;
        let total = parse_content_range(response.headers().get(CONTENT_RANGE));
        let items: Vec<Document> = response.json().await?;

        Ok(DocumentPage::new(items, total, query.offset, query.limit))
    }

    async fn signed_url(&self, path: &str, expires_in: u64) -> Result<String> {
        let path = format!(
            "storage/v1/object/sign/{}/{}",
            self.documents_bucket,
            path.trim_start_matches('/')
        );
        let request = self
            .request(Method::POST, &path)?
            .json(&SignRequest { expires_in });
        let response = Self::check(request.send().await?).await?;
        let signed: SignResponse = response.json().await?;

        // The signed path is relative to the storage API root.
        Ok(format!(
            "{}storage/v1/{}",
            self.base,
            signed.signed_url.trim_start_matches('/')
        ))
    }

    fn public_url(&self, path: &str) -> String {
        self.storage_url(&self.documents_bucket, path)
    }
}

#[async_trait]
impl ChatRepository for SupabaseClient {
    async fn create_session(&self, user_id: &str) -> Result<ChatSessionRecord> {
        let request = self
            .request(Method::POST, "rest/v1/chat_sessions")?
            .header(PREFER, RETURN_REPRESENTATION)
            .json(&NewChatSession { user_id });

        Self::single(request, "chat_sessions").await
    }

    async fn latest_session(
        &self,
        user_id: &str,
    ) -> Result<Option<ChatSessionRecord>> {
        let filter = format!("eq.{user_id}");
        let request = self
            .request(Method::GET, "rest/v1/chat_sessions")?
            .query(&[
                ("select", "*"),
                ("user_id", filter.as_str()),
                ("order", "updated_at.desc"),
                ("limit", "1"),
            ]);

        Ok(Self::rows(request).await?.into_iter().next())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessageRecord>> {
        let filter = format!("eq.{session_id}");
        let request = self
            .request(Method::GET, "rest/v1/chat_messages")?
            .query(&[
                ("select", "*"),
                ("session_id", filter.as_str()),
                ("order", "created_at.asc"),
            ]);

        Self::rows(request).await
    }

    async fn append(&self, message: &NewChatMessage) -> Result<ChatMessageRecord> {
        let request = self
            .request(Method::POST, "rest/v1/chat_messages")?
            .header(PREFER, RETURN_REPRESENTATION)
            .json(message);

        Self::single(request, "chat_messages").await
    }
}

#[async_trait]
impl ObjectStorage for SupabaseClient {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let request = self
            .request(Method::POST, &format!("storage/v1/object/{bucket}/{path}"))?
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(bytes);
        Self::check(request.send().await?).await?;

        Ok(path.to_owned())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        self.storage_url(bucket, path)
    }
}

#[async_trait]
impl EdgeFunctions for SupabaseClient {
    async fn verify_inn(
        &self,
        request: &VerifyInnRequest<'_>,
    ) -> Result<RegistryVerification> {
        self.invoke("verify-inn", request).await
    }

    async fn ask(&self, request: &AskRequest) -> Result<AskResponse> {
        self.invoke("ask", request).await
    }

    async fn report_issue(&self, request: &TicketRequest) -> Result<TicketResponse> {
        self.invoke("report-issue", request).await
    }
}
