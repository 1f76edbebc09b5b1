//! Support ticket form.
//!
//! An optional screenshot is uploaded first. The ticket only carries its
//! public URL.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::backend::{Backend, EdgeFunctions, ObjectStorage};
use crate::clock::Clock;
use crate::error::{AttachmentError, PortalError, Result};
use crate::telemetry::ErrorReporter;

/// Image types accepted as screenshots.
pub const ALLOWED_SCREENSHOT_TYPES: &[&str] =
    &["image/jpeg", "image/png", "image/webp", "image/gif"];

/// Shown when the ticket endpoint refuses without a reason.
const DEFAULT_TICKET_ERROR: &str = "The request could not be submitted.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportTopic {
    TechnicalIssue,
    ImprovementSuggestion,
    FunctionalityQuestion,
    Other,
}

impl SupportTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupportTopic::TechnicalIssue => "technical_issue",
            SupportTopic::ImprovementSuggestion => "improvement_suggestion",
            SupportTopic::FunctionalityQuestion => "functionality_question",
            SupportTopic::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Open,
    InProgress,
    Closed,
}

/// Screenshot picked by the user.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl Attachment {
    pub fn new(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Check size ceiling and image type.
    pub fn check(&self, max_bytes: usize) -> std::result::Result<(), AttachmentError> {
        if self.bytes.len() > max_bytes {
            return Err(AttachmentError::TooLarge {
                size: self.bytes.len(),
                max: max_bytes,
            });
        }

        if !ALLOWED_SCREENSHOT_TYPES.contains(&self.mime_type.as_str()) {
            return Err(AttachmentError::UnsupportedType(self.mime_type.clone()));
        }

        Ok(())
    }

    /// Lowercase file extension, `png` when the name has none.
    pub fn extension(&self) -> String {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.trim().to_lowercase())
            .filter(|ext| !ext.is_empty())
            .unwrap_or_else(|| "png".to_owned())
    }

    /// Unique object path under `screenshots/`.
    fn object_path(&self, now_millis: i64) -> String {
        format!(
            "screenshots/ticket_{now_millis}_{}.{}",
            Alphanumeric.sample_string(&mut OsRng, 10).to_lowercase(),
            self.extension()
        )
    }
}

fn validate_not_blank(value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }

    Ok(())
}

fn validate_checked(value: &bool) -> std::result::Result<(), ValidationError> {
    if !value {
        return Err(ValidationError::new("unchecked"));
    }

    Ok(())
}

/// Raw form input.
#[derive(Debug, Clone, Default, Validate)]
pub struct SupportForm {
    #[validate(required(message = "Please choose a topic."))]
    pub topic: Option<SupportTopic>,
    #[validate(custom(
        function = "validate_not_blank",
        message = "Message is required."
    ))]
    pub message: String,
    #[validate(email(message = "Email must be formatted."))]
    pub email: Option<String>,
    #[validate(custom(
        function = "validate_checked",
        message = "Consent to data processing is required."
    ))]
    pub consent: bool,
    pub attachment: Option<Attachment>,
}

impl SupportForm {
    /// Trim fields and drop an empty email.
    fn normalize(mut self) -> Self {
        self.email = self
            .email
            .map(|email| email.trim().to_owned())
            .filter(|email| !email.is_empty());
        self.message = self.message.trim().to_owned();
        self
    }
}

/// Request body of the ticket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub topic: SupportTopic,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
}

/// Ticket endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TicketResponse {
    pub success: bool,
    pub ticket_id: Option<String>,
    pub message: Option<String>,
}

/// Submitted ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupportTicket {
    pub id: Option<String>,
    pub email: Option<String>,
    pub topic: SupportTopic,
    pub message: String,
    pub screenshot: Option<String>,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
}

/// Validation failure of one form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    let mut fields: Vec<FieldError> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue
                    .message
                    .as_ref()
                    .map_or_else(|| issue.code.to_string(), |m| m.to_string()),
            })
        })
        .collect();
    fields.sort_by(|a, b| a.field.cmp(&b.field));
    fields
}

/// Observable state of a [`SupportDesk`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupportState {
    pub submitting: bool,
    pub error: Option<String>,
    pub field_errors: Vec<FieldError>,
    /// Last successfully submitted ticket.
    pub ticket: Option<SupportTicket>,
}

/// Support form submission.
pub struct SupportDesk {
    objects: Arc<dyn ObjectStorage>,
    functions: Arc<dyn EdgeFunctions>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ErrorReporter>,
    bucket: String,
    max_screenshot_bytes: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    state: SupportState,
    disposed: bool,
}

impl SupportDesk {
    pub fn new(
        backend: &Backend,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ErrorReporter>,
        bucket: impl Into<String>,
        max_screenshot_bytes: usize,
    ) -> Self {
        Self {
            objects: backend.objects.clone(),
            functions: backend.functions.clone(),
            clock,
            reporter,
            bucket: bucket.into(),
            max_screenshot_bytes,
            inner: Mutex::default(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SupportState {
        self.inner().state.clone()
    }

    /// Stop applying submission results to the state.
    pub fn dispose(&self) {
        self.inner().disposed = true;
    }

    pub fn clear_error(&self) {
        let state = &mut self.inner().state;
        state.error = None;
        state.field_errors.clear();
    }

    /// Validate and submit `form`. Returns whether a ticket was created.
    ///
    /// Invalid input is refused before any upload. A failed upload aborts the
    /// submission.
    pub async fn submit(&self, form: SupportForm) -> bool {
        {
            let mut inner = self.inner();
            if inner.disposed || inner.state.submitting {
                return false;
            }
            inner.state.submitting = true;
            inner.state.error = None;
            inner.state.field_errors.clear();
        }

        let result = self
            .send(form.normalize())
            .instrument(tracing::info_span!("support.submit"))
            .await;

        let mut inner = self.inner();
        let disposed = inner.disposed;
        let state = &mut inner.state;
        if !disposed {
            state.submitting = false;
        }
        match result {
            Ok(ticket) => {
                tracing::info!(ticket_id = ?ticket.id, topic = ticket.topic.as_str(), "ticket submitted");
                metrics::counter!("portal_tickets_total", "outcome" => "submitted")
                    .increment(1);
                if !disposed {
                    state.ticket = Some(ticket);
                }
                true
            },
            Err(err) => {
                let outcome = match &err {
                    PortalError::Validation(errors) => {
                        if !disposed {
                            state.field_errors = parse_validation_errors(errors);
                        }
                        "invalid"
                    },
                    err if err.is_local() => "invalid",
                    PortalError::Attachment(AttachmentError::UploadFailed(_)) => {
                        self.reporter.report(&err, "support.upload");
                        "error"
                    },
                    err if err.is_service() => {
                        self.reporter.report(err, "support.submit");
                        "error"
                    },
                    _ => "rejected",
                };
                tracing::info!(outcome, error = %err, "ticket not submitted");
                metrics::counter!("portal_tickets_total", "outcome" => outcome)
                    .increment(1);
                if !disposed {
                    state.error = Some(err.user_message());
                }
                false
            },
        }
    }

    async fn send(&self, form: SupportForm) -> Result<SupportTicket> {
        form.validate()?;
        let topic = form.topic.ok_or_else(|| PortalError::internal("topic missing"))?;

        let screenshot_url = match &form.attachment {
            Some(attachment) => Some(self.upload(attachment).await?),
            None => None,
        };

        let response = self
            .functions
            .report_issue(&TicketRequest {
                email: form.email.clone(),
                topic,
                message: form.message.clone(),
                screenshot_url: screenshot_url.clone(),
            })
            .await?;

        if !response.success {
            return Err(PortalError::Rejected(
                response
                    .message
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_TICKET_ERROR.to_owned()),
            ));
        }

        Ok(SupportTicket {
            id: response.ticket_id,
            email: form.email,
            topic,
            message: form.message,
            screenshot: screenshot_url,
            status: TicketStatus::Open,
            created_at: self.clock.now(),
        })
    }

    /// Upload the screenshot and return its public URL.
    async fn upload(&self, attachment: &Attachment) -> Result<String> {
        attachment.check(self.max_screenshot_bytes)?;

        let path = attachment.object_path(self.clock.now_millis());
        let stored = self
            .objects
            .upload(
                &self.bucket,
                &path,
                attachment.bytes.clone(),
                &attachment.mime_type,
            )
            .await
            .map_err(|err| AttachmentError::UploadFailed(Box::new(err)))?;

        tracing::debug!(path = %stored, size = attachment.bytes.len(), "screenshot uploaded");
        Ok(self.objects.public_url(&self.bucket, &stored))
    }
}
