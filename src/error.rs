//! Error handler for the portal.
//!
//! Every public operation catches its own failures and stores
//! [`PortalError::user_message`] in the matching state object. The enum itself
//! only travels between internal layers.

use std::time::Duration;

use thiserror::Error;
use validator::ValidationErrors;

pub type Result<T> = std::result::Result<T, PortalError>;

/// Generic text shown when a collaborator is unreachable.
pub const SERVICE_UNAVAILABLE: &str =
    "Service temporarily unavailable, please try again later.";

/// Enum representing portal-side errors.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error("INN must contain 10 or 12 digits with a valid checksum")]
    InvalidInn,

    #[error("invalid email")]
    InvalidEmail,

    #[error("message cannot be empty")]
    EmptyMessage,

    #[error("message cannot exceed {max} characters")]
    MessageTooLong { max: usize },

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    /// Well-formed request refused by a collaborator.
    #[error("{0}")]
    Rejected(String),

    #[error(
        "too many login attempts, try again in {} minutes",
        .retry_after.as_secs().div_ceil(60).max(1)
    )]
    TooManyLoginAttempts { retry_after: Duration },

    #[error("daily limit of {limit} questions reached")]
    QuotaExceeded { limit: u32 },

    #[error("this action requires an authenticated member")]
    NotAuthenticated,

    #[error("malformed `{table}` record: {details}")]
    MalformedRecord {
        table: &'static str,
        details: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend answered {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("local storage error: {0}")]
    Storage(String),

    #[error("internal error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Screenshot related failures of the support form.
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("screenshot size exceeds {} MB", .max / (1024 * 1024))]
    TooLarge { size: usize, max: usize },

    #[error("unsupported screenshot format `{0}`, allowed: JPG, PNG, WEBP, GIF")]
    UnsupportedType(String),

    #[error("screenshot upload failed")]
    UploadFailed(#[source] Box<PortalError>),
}

impl PortalError {
    /// Create an [`PortalError::Internal`] with a plain description.
    pub fn internal(details: impl Into<String>) -> Self {
        Self::Internal {
            details: details.into(),
            source: None,
        }
    }

    /// Whether the error was detected locally before any network call.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InvalidInn
                | Self::InvalidEmail
                | Self::EmptyMessage
                | Self::MessageTooLong { .. }
                | Self::TooManyLoginAttempts { .. }
                | Self::QuotaExceeded { .. }
                | Self::Attachment(AttachmentError::TooLarge { .. })
                | Self::Attachment(AttachmentError::UnsupportedType(_))
        )
    }

    /// Whether a collaborator could not be reached or failed internally.
    pub fn is_service(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Backend { .. }
                | Self::Internal { .. }
                | Self::MalformedRecord { .. }
        )
    }

    /// Plain message stored in state and rendered near the triggering
    /// control.
    pub fn user_message(&self) -> String {
        match self {
            PortalError::Validation(errors) => errors
                .field_errors()
                .values()
                .flat_map(|issues| issues.iter())
                .find_map(|issue| issue.message.as_ref().map(|m| m.to_string()))
                .unwrap_or_else(|| self.to_string()),
            err if err.is_service() => SERVICE_UNAVAILABLE.to_owned(),
            err => err.to_string(),
        }
    }
}

/// Convert foreign errors into [`PortalError::Internal`].
pub trait ToInternal<T> {
    fn catch(self) -> Result<T>;
}

impl<T, E> ToInternal<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn catch(self) -> Result<T> {
        self.map_err(|err| PortalError::Internal {
            details: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}
