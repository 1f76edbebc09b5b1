//! Document catalog with search, sort and offset pagination.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::SessionStore;
use crate::backend::DocumentRepository;
use crate::telemetry::ErrorReporter;
use crate::user::Role;

/// Lifetime of a signed download link, in seconds.
pub const SIGNED_URL_TTL: u64 = 3600;

/// Catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    /// Storage key inside the documents bucket.
    pub file_path: String,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Document {
    /// Human readable size, empty when unknown.
    pub fn human_size(&self) -> String {
        self.file_size.map(format_file_size).unwrap_or_default()
    }
}

/// Format a byte count with binary units, such as `1.5 MB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 Bytes".to_owned();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = format!("{value:.2}");
    let rounded = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{rounded} {}", UNITS[unit])
}

/// Single-key ordering of the catalog.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SortOption {
    /// Most recently updated first.
    #[default]
    Newest,
    Oldest,
    /// Alphabetical by title.
    Title,
}

impl SortOption {
    /// PostgREST `order` parameter.
    pub fn order(&self) -> &'static str {
        match self {
            SortOption::Newest => "updated_at.desc",
            SortOption::Oldest => "updated_at.asc",
            SortOption::Title => "title.asc",
        }
    }
}

/// Parameters of one catalog page.
///
/// The public-only filter is derived from the role and cannot be set
/// directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentQuery {
    pub search: String,
    pub sort: SortOption,
    pub limit: u32,
    pub offset: u64,
    public_only: bool,
}

impl DocumentQuery {
    pub fn new(
        role: Role,
        search: impl Into<String>,
        sort: SortOption,
        limit: u32,
        offset: u64,
    ) -> Self {
        Self {
            search: search.into(),
            sort,
            limit,
            offset,
            public_only: role == Role::Guest,
        }
    }

    #[inline]
    pub fn public_only(&self) -> bool {
        self.public_only
    }
}

/// One page of results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentPage {
    pub items: Vec<Document>,
    pub total_count: Option<u64>,
    pub has_next_page: bool,
}

impl DocumentPage {
    pub fn new(
        items: Vec<Document>,
        total_count: Option<u64>,
        offset: u64,
        limit: u32,
    ) -> Self {
        let has_next_page = total_count
            .is_some_and(|total| offset + u64::from(limit) < total);
        Self {
            items,
            total_count,
            has_next_page,
        }
    }
}

/// Observable state of a [`DocumentCatalog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogState {
    pub items: Vec<Document>,
    pub search: String,
    pub sort: SortOption,
    pub total_count: Option<u64>,
    pub has_next_page: bool,
    /// A fresh query is in flight.
    pub loading: bool,
    /// A next page is in flight.
    pub loading_more: bool,
    pub error: Option<String>,
}

impl Default for CatalogState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            search: String::new(),
            sort: SortOption::default(),
            total_count: None,
            has_next_page: true,
            loading: false,
            loading_more: false,
            error: None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: CatalogState,
    next_offset: u64,
    /// Bumped by every fresh query. Responses of older generations are
    /// dropped.
    generation: u64,
    disposed: bool,
}

/// Stateful catalog view.
pub struct DocumentCatalog {
    repository: Arc<dyn DocumentRepository>,
    session: Arc<SessionStore>,
    reporter: Arc<dyn ErrorReporter>,
    page_size: u32,
    inner: Mutex<Inner>,
}

impl DocumentCatalog {
    pub fn new(
        repository: Arc<dyn DocumentRepository>,
        session: Arc<SessionStore>,
        reporter: Arc<dyn ErrorReporter>,
        page_size: u32,
    ) -> Self {
        Self {
            repository,
            session,
            reporter,
            page_size: page_size.max(1),
            inner: Mutex::default(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> CatalogState {
        self.inner().state.clone()
    }

    /// Query from offset zero with the current search and sort.
    pub async fn refresh(&self) {
        self.fetch(false).await
    }

    /// Change the search term and query again.
    pub async fn set_search(&self, search: impl Into<String>) {
        self.inner().state.search = search.into();
        self.fetch(false).await
    }

    /// Change the sort option and query again.
    pub async fn set_sort(&self, sort: SortOption) {
        self.inner().state.sort = sort;
        self.fetch(false).await
    }

    /// Append the next page. No-op while a query is in flight or after the
    /// last page.
    pub async fn load_more(&self) {
        self.fetch(true).await
    }

    /// Re-issue the current query from offset zero, replacing the list.
    pub async fn retry(&self) {
        self.fetch(false).await
    }

    /// Stop applying responses to the state.
    pub fn dispose(&self) {
        self.inner().disposed = true;
    }

    async fn fetch(&self, append: bool) {
        let role = self.session.role();
        let (query, generation) = {
            let mut inner = self.inner();
            if inner.disposed {
                return;
            }

            if append {
                if inner.state.loading
                    || inner.state.loading_more
                    || !inner.state.has_next_page
                {
                    return;
                }
                inner.state.loading_more = true;
            } else {
                inner.generation += 1;
                inner.next_offset = 0;
                inner.state.loading = true;
                inner.state.loading_more = false;
            }
            inner.state.error = None;

            let query = DocumentQuery::new(
                role,
                inner.state.search.clone(),
                inner.state.sort,
                self.page_size,
                inner.next_offset,
            );
            (query, inner.generation)
        };

        tracing::debug!(
            role = %role,
            search = %query.search,
            offset = query.offset,
            append,
            "querying documents"
        );
        metrics::counter!(
            "portal_documents_queries_total",
            "kind" => if append { "more" } else { "fresh" }
        )
        .increment(1);

        let result = self.repository.query(&query).await;

        let mut inner = self.inner();
        if inner.disposed || inner.generation != generation {
            tracing::debug!(generation, "discarding stale document page");
            return;
        }

        match result {
            Ok(page) => {
                if append {
                    inner.state.items.extend(page.items);
                } else {
                    inner.state.items = page.items;
                }
                inner.next_offset = query.offset + u64::from(query.limit);
                inner.state.total_count = page.total_count;
                inner.state.has_next_page = page.has_next_page;
            },
            Err(err) => {
                self.reporter.report(&err, "documents.query");
                inner.state.error = Some(err.user_message());
                if !append {
                    inner.state.items.clear();
                    inner.state.total_count = None;
                    inner.state.has_next_page = false;
                }
            },
        }

        if append {
            inner.state.loading_more = false;
        } else {
            inner.state.loading = false;
        }
    }

    /// Download link of `document`: public link for public documents,
    /// signed link otherwise. Failures are stored in the state.
    pub async fn download_url(&self, document: &Document) -> Option<String> {
        if document.is_public {
            return Some(self.repository.public_url(&document.file_path));
        }

        match self
            .repository
            .signed_url(&document.file_path, SIGNED_URL_TTL)
            .await
        {
            Ok(url) => Some(url),
            Err(err) => {
                self.reporter.report(&err, "documents.download_url");
                let mut inner = self.inner();
                if !inner.disposed {
                    inner.state.error = Some(err.user_message());
                }
                None
            },
        }
    }

    pub fn clear_error(&self) {
        self.inner().state.error = None;
    }
}
