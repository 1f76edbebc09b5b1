//! Configuration manager for the portal.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    #[serde(skip_deserializing)]
    pub version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to the backend project.
    pub supabase: Supabase,
    /// Quotas and thresholds.
    pub limits: Limits,
    /// Related to on-device storage.
    pub storage: StorageConfig,
    /// Related to logs and metrics.
    pub telemetry: Telemetry,
}

/// Backend project configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Supabase {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    /// Public anonymous key.
    #[serde(skip_serializing)]
    pub anon_key: String,
    /// Timeout of every request, in seconds.
    pub timeout_secs: u64,
    /// Bucket holding catalog files.
    pub documents_bucket: String,
    /// Bucket receiving support screenshots.
    pub screenshots_bucket: String,
}

impl Default for Supabase {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            timeout_secs: 10,
            documents_bucket: "documents".into(),
            screenshots_bucket: "support-screenshots".into(),
        }
    }
}

/// Quotas and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Questions a guest may ask per calendar day.
    pub guest_daily_questions: u32,
    /// Maximum question length for guests, in characters.
    pub guest_question_length: usize,
    /// Maximum question length for members, in characters.
    pub member_question_length: usize,
    /// Guest transcript turns kept on the device.
    pub guest_history_size: usize,
    /// Login attempts allowed per INN in one window.
    pub login_attempts: usize,
    pub login_window_secs: u64,
    /// Days before expiry at which a membership is "expiring".
    pub membership_warning_days: i64,
    pub screenshot_max_bytes: usize,
    pub document_page_size: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            guest_daily_questions: 3,
            guest_question_length: 500,
            member_question_length: 2000,
            guest_history_size: 20,
            login_attempts: 5,
            login_window_secs: 15 * 60,
            membership_warning_days: crate::membership::DEFAULT_WARNING_DAYS,
            screenshot_max_bytes: 5 * 1024 * 1024, // 5 MiB.
            document_page_size: 20,
        }
    }
}

/// On-device storage configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file backing the key-value store. In-memory when unset.
    pub path: Option<PathBuf>,
}

/// Logs and metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// OTLP collector receiving logs, e.g. `http://localhost:4317`.
    pub otlp_endpoint: Option<String>,
    /// Install a Prometheus recorder.
    pub prometheus: bool,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            level: "info".into(),
            otlp_endpoint: None,
            prometheus: false,
        }
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Replace backend credentials with `SUPABASE_URL` and
    /// `SUPABASE_ANON_KEY` when `get` knows them.
    pub fn apply_overrides(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = get("SUPABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.supabase.url = url.trim().to_owned();
        }
        if let Some(key) = get("SUPABASE_ANON_KEY").filter(|v| !v.trim().is_empty()) {
            self.supabase.anon_key = key.trim().to_owned();
        }
        self
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location, then applies environment overrides.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        let config = match File::open(file_path) {
            Ok(file) => match serde_yaml::from_reader::<_, Configuration>(file) {
                Ok(config) => config.path(file_path.clone()),
                Err(err) => self.error(err),
            },
            Err(err) => self.error(err),
        };

        config
            .apply_overrides(|key| std::env::var(key).ok())
            .finish()
            .map(Arc::new)
    }

    /// Set version and normalize URLs.
    fn finish(mut self) -> Result<Self, url::ParseError> {
        self.version = VERSION.to_owned();
        if !self.supabase.url.is_empty() {
            self.supabase.url = self.normalize_url(&self.supabase.url)?;
        }
        self.telemetry.otlp_endpoint = self
            .telemetry
            .otlp_endpoint
            .take()
            .filter(|endpoint| !endpoint.trim().is_empty());

        Ok(self)
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, path = %self.path.display(), "cannot read configuration, using defaults");
        Self {
            version: VERSION.to_owned(),
            path: self.path.clone(),
            ..Default::default()
        }
    }
}
