//! Paginated, resumable source readers.
//!
//! Every connector implements [`SourceListing`]: list the parent scopes it
//! can read (repositories, channels, folders, spaces) and fetch one page of
//! documents inside a scope given an opaque cursor. The generic readers in
//! this module own the pagination state:
//!
//! ```text
//! NestedReader ── scopes: [A, B, C], position
//!      │
//!      └── ScopedReader ── scope, cursor, has_more
//!               │
//!               └── SourceListing::fetch_page(scope, cursor, n)
//! ```
//!
//! The outer reader advances to the next scope only when the inner one is
//! exhausted. The inner reader restarts itself whenever it is asked to read
//! a scope other than the one it was reading.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::models::{DataSource, Document};

/// A parent scope of a two-level listing.
pub trait Scope: Clone + Send + Sync + 'static {
    /// Stable identity used to detect scope switches.
    fn scope_id(&self) -> String;
}

/// One page of documents plus the cursor for the next one.
#[derive(Debug, Default)]
pub struct Page {
    pub documents: Vec<Document>,
    /// `None` when the scope is exhausted.
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn last(documents: Vec<Document>) -> Self {
        Self {
            documents,
            next_cursor: None,
        }
    }
}

/// Source-specific listing calls consumed by the generic readers.
#[async_trait]
pub trait SourceListing: Send + Sync + 'static {
    type Scope: Scope;

    fn source(&self) -> DataSource;

    /// All scopes the reading credential can see.
    async fn list_scopes(&self) -> Result<Vec<Self::Scope>>;

    /// Fetch one page inside `scope`. Non-file entries are skipped, so a page
    /// may hold fewer than `page_size` documents.
    async fn fetch_page(
        &self,
        scope: &Self::Scope,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page>;
}

/// The reader contract used by callers.
#[async_trait]
pub trait PageReader: Send {
    fn source(&self) -> DataSource;

    /// Read the next page. Returns an empty page, without side effects, once
    /// [`has_more`](PageReader::has_more) is false.
    async fn load_page(&mut self, page_size: usize) -> Result<Vec<Document>>;

    fn has_more(&self) -> bool;

    /// Reset pagination to the start of the traversal.
    fn restart(&mut self);

    /// Call [`load_page`](PageReader::load_page) until exhausted, continuing
    /// from the current position. Unbounded latency; use `load_page` directly
    /// when that matters.
    async fn load_all(&mut self, page_size: usize) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        while self.has_more() {
            documents.extend(self.load_page(page_size).await?);
        }
        Ok(documents)
    }
}

/// Pagination state inside a single scope.
pub struct ScopedReader<L: SourceListing> {
    listing: Arc<L>,
    scope: Option<L::Scope>,
    cursor: Option<String>,
    has_more: bool,
}

impl<L: SourceListing> ScopedReader<L> {
    pub fn new(listing: Arc<L>) -> Self {
        Self {
            listing,
            scope: None,
            cursor: None,
            has_more: true,
        }
    }

    /// Read the next page of `scope`.
    ///
    /// Asking for a different scope than the last one read restarts the
    /// reader first. State only advances after a successful fetch, so a
    /// failed page can be retried as is.
    pub async fn read_scope(&mut self, scope: &L::Scope, page_size: usize) -> Result<Vec<Document>> {
        let same_scope = self
            .scope
            .as_ref()
            .is_some_and(|current| current.scope_id() == scope.scope_id());
        if !same_scope {
            self.restart();
            self.scope = Some(scope.clone());
        }

        if !self.has_more {
            return Ok(Vec::new());
        }

        let page = self
            .listing
            .fetch_page(scope, self.cursor.as_deref(), page_size.max(1))
            .await?;

        debug!(
            source = %self.listing.source(),
            scope = %scope.scope_id(),
            documents = page.documents.len(),
            more = page.next_cursor.is_some(),
            "fetched page"
        );

        self.has_more = page.next_cursor.is_some();
        self.cursor = page.next_cursor;
        Ok(page.documents)
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn current_scope(&self) -> Option<&L::Scope> {
        self.scope.as_ref()
    }

    pub fn restart(&mut self) {
        self.scope = None;
        self.cursor = None;
        self.has_more = true;
    }
}

/// Two-level reader: every scope of a listing (or one pinned scope), page by
/// page.
pub struct NestedReader<L: SourceListing> {
    listing: Arc<L>,
    inner: ScopedReader<L>,
    pinned: Option<L::Scope>,
    scopes: Option<Vec<L::Scope>>,
    position: usize,
}

impl<L: SourceListing> NestedReader<L> {
    /// Read every scope returned by [`SourceListing::list_scopes`].
    pub fn new(listing: L) -> Self {
        let listing = Arc::new(listing);
        Self {
            inner: ScopedReader::new(Arc::clone(&listing)),
            listing,
            pinned: None,
            scopes: None,
            position: 0,
        }
    }

    /// Read a single scope fixed at construction.
    pub fn pinned(listing: L, scope: L::Scope) -> Self {
        let mut reader = Self::new(listing);
        reader.pinned = Some(scope);
        reader
    }

    pub fn listing(&self) -> &L {
        &self.listing
    }

    /// Scopes of the current traversal, listed once and then reused.
    pub async fn scopes(&mut self) -> Result<&[L::Scope]> {
        if self.scopes.is_none() {
            let scopes = match &self.pinned {
                Some(scope) => vec![scope.clone()],
                None => self.listing.list_scopes().await?,
            };
            debug!(source = %self.listing.source(), scopes = scopes.len(), "listed scopes");
            self.scopes = Some(scopes);
            self.position = 0;
        }
        Ok(self.scopes.as_deref().unwrap_or_default())
    }

    /// Read one page of an explicit scope, bypassing the scope traversal.
    pub async fn read_scope(&mut self, scope: &L::Scope, page_size: usize) -> Result<Vec<Document>> {
        self.inner.read_scope(scope, page_size).await
    }

    /// Whether the explicitly read scope has more pages.
    pub fn scope_has_more(&self) -> bool {
        self.inner.has_more()
    }
}

#[async_trait]
impl<L: SourceListing> PageReader for NestedReader<L> {
    fn source(&self) -> DataSource {
        self.listing.source()
    }

    async fn load_page(&mut self, page_size: usize) -> Result<Vec<Document>> {
        self.scopes().await?;

        loop {
            let Some(scope) = self
                .scopes
                .as_ref()
                .and_then(|scopes| scopes.get(self.position))
                .cloned()
            else {
                return Ok(Vec::new());
            };

            let documents = self.inner.read_scope(&scope, page_size).await?;
            if !self.inner.has_more() {
                self.position += 1;
            }

            // Empty scopes and all-folder pages should not surface as empty
            // pages while more remain.
            if !documents.is_empty() || !self.has_more() {
                return Ok(documents);
            }
        }
    }

    fn has_more(&self) -> bool {
        match &self.scopes {
            None => true,
            Some(scopes) => self.position < scopes.len(),
        }
    }

    fn restart(&mut self) {
        self.inner.restart();
        self.scopes = None;
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::MultipassError;
    use crate::models::{keys, Metadata};

    #[derive(Clone, Debug)]
    struct Repo(String);

    impl Scope for Repo {
        fn scope_id(&self) -> String {
            self.0.clone()
        }
    }

    /// Three repositories with 2, 3 and 3 files; cursors are offsets.
    struct Fixture {
        repos: Vec<(String, Vec<String>)>,
        fail_next: AtomicUsize,
    }

    impl Fixture {
        fn new() -> Self {
            let repo = |name: &str, n: usize| {
                (
                    name.to_string(),
                    (0..n).map(|i| format!("{}/file{}.md", name, i)).collect(),
                )
            };
            Self {
                repos: vec![repo("a", 2), repo("b", 3), repo("c", 3)],
                fail_next: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceListing for Fixture {
        type Scope = Repo;

        fn source(&self) -> DataSource {
            DataSource::GitHub
        }

        async fn list_scopes(&self) -> Result<Vec<Repo>> {
            Ok(self.repos.iter().map(|(n, _)| Repo(n.clone())).collect())
        }

        async fn fetch_page(&self, scope: &Repo, cursor: Option<&str>, page_size: usize) -> Result<Page> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(MultipassError::unavailable(DataSource::GitHub, &scope.0, "HTTP 502"));
            }
            let files = &self
                .repos
                .iter()
                .find(|(n, _)| *n == scope.0)
                .map(|(_, f)| f.clone())
                .unwrap_or_default();
            let start: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (start + page_size).min(files.len());
            let documents = files[start..end]
                .iter()
                .map(|path| {
                    let mut md = Metadata::new();
                    md.insert(keys::DATA_SOURCE.into(), "github".into());
                    md.insert(keys::FILE_PATH.into(), path.as_str().into());
                    Document::new(path.clone(), md)
                })
                .collect();
            Ok(Page {
                documents,
                next_cursor: (end < files.len()).then(|| end.to_string()),
            })
        }
    }

    fn path(doc: &Document) -> String {
        doc.metadata[keys::FILE_PATH].to_string()
    }

    #[tokio::test]
    async fn test_page_size_one_yields_every_document_once() {
        let mut reader = NestedReader::new(Fixture::new());
        let mut seen = Vec::new();
        while reader.has_more() {
            let page = reader.load_page(1).await.unwrap();
            assert_eq!(page.len(), 1);
            seen.extend(page.iter().map(path));
        }
        assert_eq!(seen.len(), 8);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 8);

        let after = reader.load_page(1).await.unwrap();
        assert!(after.is_empty());
        assert!(!reader.has_more());
    }

    #[tokio::test]
    async fn test_load_all_concatenates() {
        let mut reader = NestedReader::new(Fixture::new());
        let docs = reader.load_all(2).await.unwrap();
        assert_eq!(docs.len(), 8);
    }

    #[tokio::test]
    async fn test_scope_switch_restarts_without_explicit_restart() {
        let listing = Arc::new(Fixture::new());
        let mut reader = ScopedReader::new(listing);

        let first_a = reader.read_scope(&Repo("a".into()), 1).await.unwrap();
        assert_eq!(path(&first_a[0]), "a/file0.md");
        assert!(reader.has_more());

        let first_b = reader.read_scope(&Repo("b".into()), 1).await.unwrap();
        assert_eq!(path(&first_b[0]), "b/file0.md");
        assert_eq!(reader.current_scope().unwrap().0, "b");
    }

    #[tokio::test]
    async fn test_exhausted_scope_is_a_no_op() {
        let mut reader = ScopedReader::new(Arc::new(Fixture::new()));
        let scope = Repo("a".into());
        assert_eq!(reader.read_scope(&scope, 10).await.unwrap().len(), 2);
        assert!(!reader.has_more());
        assert!(reader.read_scope(&scope, 10).await.unwrap().is_empty());
        assert!(!reader.has_more());
    }

    #[tokio::test]
    async fn test_failed_page_leaves_state_for_retry() {
        let listing = Fixture::new();
        let mut reader = NestedReader::new(listing);
        let first = reader.load_page(1).await.unwrap();
        assert_eq!(path(&first[0]), "a/file0.md");

        reader.listing().fail_next.store(1, Ordering::SeqCst);
        let err = reader.load_page(1).await.unwrap_err();
        assert!(err.is_retryable());

        let retried = reader.load_page(1).await.unwrap();
        assert_eq!(path(&retried[0]), "a/file1.md");
    }

    #[tokio::test]
    async fn test_restart_rewinds_traversal() {
        let mut reader = NestedReader::new(Fixture::new());
        reader.load_page(3).await.unwrap();
        reader.restart();
        let again = reader.load_page(1).await.unwrap();
        assert_eq!(path(&again[0]), "a/file0.md");
    }

    #[tokio::test]
    async fn test_pinned_reader_reads_one_scope() {
        let mut reader = NestedReader::pinned(Fixture::new(), Repo("c".into()));
        let docs = reader.load_all(10).await.unwrap();
        assert_eq!(docs.len(), 3);
        assert!(docs.iter().all(|d| path(d).starts_with("c/")));
    }
}
