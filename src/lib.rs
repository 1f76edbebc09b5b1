//! Client core of the SRO membership portal.
//!
//! INN login against the SRO registry, a role-aware document catalog, an AI
//! consultant with a guest quota and a support desk, on top of a
//! backend-as-a-service project.

#![forbid(unsafe_code)]

pub mod auth;
pub mod backend;
pub mod chat;
pub mod clock;
pub mod config;
pub mod documents;
pub mod error;
pub mod membership;
pub mod storage;
pub mod support;
pub mod telemetry;
pub mod user;
pub mod validation;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::SessionStore;
use crate::backend::{Backend, SupabaseClient};
use crate::chat::ChatSession;
use crate::clock::{Clock, SystemClock};
use crate::config::Configuration;
use crate::documents::DocumentCatalog;
use crate::error::Result;
use crate::storage::{DisabledStore, FileStore, Storage};
use crate::support::SupportDesk;
use crate::telemetry::{ErrorReporter, TracingReporter};

/// Context shared by every component, built once at start.
pub struct Portal {
    config: Arc<Configuration>,
    storage: Storage,
    backend: Backend,
    session: Arc<SessionStore>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ErrorReporter>,
    metrics: Option<PrometheusHandle>,
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("config", &self.config)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Portal {
    /// Assemble a portal from its collaborators.
    pub fn new(
        config: Arc<Configuration>,
        storage: Storage,
        backend: Backend,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let session = Arc::new(SessionStore::new(
            backend.clone(),
            storage.clone(),
            clock.clone(),
            reporter.clone(),
            &config.limits,
        ));

        Self {
            config,
            storage,
            backend,
            session,
            clock,
            reporter,
            metrics: None,
        }
    }

    /// Open local storage and connect to the configured backend project.
    pub fn connect(config: Arc<Configuration>) -> Result<Self> {
        let storage = open_storage(&config);
        let client = SupabaseClient::new(&config.supabase, storage.clone())?;

        Ok(Self::new(
            config,
            storage,
            Backend::supabase(Arc::new(client)),
            Arc::new(SystemClock),
            Arc::new(TracingReporter::new()),
        ))
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Current actor and membership state.
    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    /// New catalog view.
    pub fn documents(&self) -> DocumentCatalog {
        DocumentCatalog::new(
            self.backend.documents.clone(),
            self.session.clone(),
            self.reporter.clone(),
            self.config.limits.document_page_size,
        )
    }

    /// New consultant chat.
    pub fn chat(&self) -> ChatSession {
        ChatSession::new(
            &self.backend,
            self.session.clone(),
            self.storage.clone(),
            self.clock.clone(),
            self.reporter.clone(),
            &self.config.limits,
        )
    }

    /// New support form.
    pub fn support(&self) -> SupportDesk {
        SupportDesk::new(
            &self.backend,
            self.clock.clone(),
            self.reporter.clone(),
            self.config.supabase.screenshots_bucket.clone(),
            self.config.limits.screenshot_max_bytes,
        )
    }

    /// Prometheus exposition of the recorded metrics, when enabled.
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}

/// Storage of `config`, disabled when the file cannot be opened.
fn open_storage(config: &Configuration) -> Storage {
    match &config.storage.path {
        Some(path) => match FileStore::open(path) {
            Ok(store) => Storage::new(Arc::new(store)),
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "cannot open local storage");
                Storage::new(Arc::new(DisabledStore))
            },
        },
        None => Storage::memory(),
    }
}

/// Read the configuration, install telemetry and restore the session.
pub async fn initialize_portal()
-> std::result::Result<Portal, Box<dyn std::error::Error + Send + Sync>> {
    // read configuration file. let it in memory.
    let config = Configuration::default().read()?;

    telemetry::setup_tracing(&config.telemetry)?;
    let metrics = if config.telemetry.prometheus {
        Some(telemetry::setup_metrics_recorder()?)
    } else {
        None
    };

    if config.supabase.url.is_empty() || config.supabase.anon_key.is_empty() {
        tracing::warn!("missing `supabase` entry on `config.yaml` file or `SUPABASE_*` variables");
    }

    let mut portal = Portal::connect(config)?;
    portal.metrics = metrics;

    portal.session.initialize().await;
    tracing::info!(
        version = %portal.config.version,
        role = %portal.session.role(),
        "portal initialized"
    );

    Ok(portal)
}
