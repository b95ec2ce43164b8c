//! Cached per-source authorization decisions.
//!
//! Every connector supplies an [`AccessCheck`]: how to pull the object
//! identity out of a document's metadata, how to ask the source whether the
//! processor's credential (or the user it checks for) may see that object,
//! and how to enumerate objects. [`AccessProcessor`] is the single generic
//! algorithm built on top of it:
//!
//! ```text
//! is_authorized(node)
//!   ├── data_source != source      → false (no lookup, no call)
//!   └── has_access(metadata)
//!         ├── object_id(metadata)   → MissingMetadataKey if absent
//!         └── cache[(object, principal)]
//!               ├── hit             → cached bool
//!               └── miss            → Direct:    check(object)
//!                                     Enumerate: list_objects() (once) ∋ object
//! ```
//!
//! Concurrent lookups of the same key collapse into one external call, and
//! errors are never cached: a failed check is retried by the next lookup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{MultipassError, Result};
use crate::filter::MetadataFilter;
use crate::models::{data_source_tag, DataSource, Metadata, MetadataAccessor, MetadataValue};

/// Identity of an object on its source (repository, channel, file, page...).
pub type ObjectId = MetadataValue;

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// How a source answers "may this principal see object X".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckShape {
    /// One external call per object.
    Direct,
    /// List everything the principal can see once, then test membership.
    Enumerate,
}

/// Source-specific half of an access processor.
#[async_trait]
pub trait AccessCheck: Send + Sync + 'static {
    fn source(&self) -> DataSource;

    /// Metadata key the `IN` predicate of [`AccessProcessor::get_filter`]
    /// constrains.
    fn filter_key(&self) -> &str;

    /// Identity of whoever access is checked for: a username, an email, or a
    /// fingerprint of the credential. Part of every cache key.
    fn principal(&self) -> &str;

    fn shape(&self) -> CheckShape;

    /// Extract the object identity, failing with `MissingMetadataKey`.
    fn object_id(&self, metadata: &Metadata) -> Result<ObjectId>;

    /// One external authorization check. The processor only calls this for
    /// [`CheckShape::Direct`]; enumerating checks answer it from
    /// [`list_objects`](Self::list_objects).
    async fn check(&self, object: &ObjectId) -> Result<bool>;

    /// Direct shape: every candidate object the credential can list.
    /// Enumerate shape: exactly the objects the principal may see.
    async fn list_objects(&self) -> Result<Vec<ObjectId>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    object: ObjectId,
    principal: String,
}

/// Generic, cached access processor over node type `N`.
///
/// One instance belongs to one filtering session; its cache is never
/// invalidated.
pub struct AccessProcessor<N, C> {
    check: C,
    accessor: Arc<dyn MetadataAccessor<N>>,
    cache: Mutex<HashMap<CacheKey, Arc<OnceCell<bool>>>>,
    objects: OnceCell<Vec<ObjectId>>,
    deadline: Duration,
    max_concurrency: usize,
}

impl<N, C> AccessProcessor<N, C>
where
    N: Clone + Send + Sync + 'static,
    C: AccessCheck,
{
    pub fn new(check: C, accessor: Arc<dyn MetadataAccessor<N>>) -> Self {
        Self {
            check,
            accessor,
            cache: Mutex::new(HashMap::new()),
            objects: OnceCell::new(),
            deadline: DEFAULT_DEADLINE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Bound every external call; exceeding it is `SourceUnavailable`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn access_check(&self) -> &C {
        &self.check
    }

    pub fn source(&self) -> DataSource {
        self.check.source()
    }

    /// Whether the principal may see the object `metadata` describes.
    pub async fn has_access(&self, metadata: &Metadata) -> Result<bool> {
        let object = self.check.object_id(metadata)?;
        self.has_access_to(&object).await
    }

    /// Cached decision for one object identity.
    pub async fn has_access_to(&self, object: &ObjectId) -> Result<bool> {
        let key = CacheKey {
            object: object.clone(),
            principal: self.check.principal().to_string(),
        };
        let cell = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(cache.entry(key).or_default())
        };

        if let Some(decision) = cell.get() {
            debug!(source = %self.source(), %object, decision, "access cache hit");
            return Ok(*decision);
        }

        let decision = cell
            .get_or_try_init(|| async {
                let decision = match self.check.shape() {
                    CheckShape::Direct => {
                        let target = object.to_string();
                        self.bounded(&target, self.check.check(object)).await?
                    }
                    CheckShape::Enumerate => self.objects().await?.contains(object),
                };
                debug!(source = %self.source(), %object, decision, "access checked");
                Ok::<bool, MultipassError>(decision)
            })
            .await?;
        Ok(*decision)
    }

    /// `data_source` must match this processor's source, then
    /// [`has_access`](Self::has_access). Foreign documents are `false`, not
    /// an error.
    pub async fn is_authorized_metadata(&self, metadata: &Metadata) -> Result<bool> {
        if data_source_tag(metadata)? != self.source().as_str() {
            return Ok(false);
        }
        self.has_access(metadata).await
    }

    pub async fn is_authorized(&self, node: &N) -> Result<bool> {
        let metadata = self.accessor.metadata(node);
        self.is_authorized_metadata(&metadata).await
    }

    /// Authorized subsequence of `nodes`, in input order.
    pub async fn filter(&self, nodes: &[N]) -> Result<Vec<N>> {
        let checks: Vec<BoxFuture<'_, Result<bool>>> = nodes
            .iter()
            .map(|node| -> BoxFuture<'_, Result<bool>> { Box::pin(self.is_authorized(node)) })
            .collect();
        let decisions: Vec<bool> = stream::iter(checks)
            .buffered(self.max_concurrency)
            .try_collect()
            .await?;

        Ok(nodes
            .iter()
            .zip(decisions)
            .filter_map(|(node, allowed)| allowed.then(|| node.clone()))
            .collect())
    }

    /// `IN` predicate over every object the principal may see.
    ///
    /// Always complete, whatever was filtered before: Enumerate processors
    /// return their memoized set, Direct processors enumerate candidates and
    /// check each one through the cache.
    pub async fn get_filter(&self) -> Result<MetadataFilter> {
        let objects = self.objects().await?;
        let allowed = match self.check.shape() {
            CheckShape::Enumerate => objects.to_vec(),
            CheckShape::Direct => {
                let checks: Vec<BoxFuture<'_, Result<bool>>> = objects
                    .iter()
                    .map(|object| -> BoxFuture<'_, Result<bool>> { Box::pin(self.has_access_to(object)) })
                    .collect();
                let decisions: Vec<bool> = stream::iter(checks)
                    .buffered(self.max_concurrency)
                    .try_collect()
                    .await?;
                objects
                    .iter()
                    .zip(decisions)
                    .filter_map(|(object, allowed)| allowed.then(|| object.clone()))
                    .collect()
            }
        };

        info!(
            source = %self.source(),
            principal = self.check.principal(),
            allowed = allowed.len(),
            "built access filter"
        );
        Ok(MetadataFilter::is_in(self.check.filter_key(), allowed))
    }

    /// Objects already known to be granted, without any external call.
    pub fn cached_grants(&self) -> Vec<ObjectId> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut granted: Vec<ObjectId> = cache
            .iter()
            .filter(|(_, cell)| cell.get().copied().unwrap_or(false))
            .map(|(key, _)| key.object.clone())
            .collect();
        granted.sort();
        granted
    }

    /// Enumeration, computed at most once per instance.
    async fn objects(&self) -> Result<&[ObjectId]> {
        let objects = self
            .objects
            .get_or_try_init(|| async {
                let objects = self.bounded("enumerate", self.check.list_objects()).await?;
                debug!(source = %self.source(), count = objects.len(), "enumerated objects");
                Ok::<Vec<ObjectId>, MultipassError>(objects)
            })
            .await?;
        Ok(objects)
    }

    async fn bounded<T>(&self, target: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(MultipassError::unavailable(
                self.source(),
                target,
                format!("deadline of {:?} exceeded", self.deadline),
            )),
        }
    }
}

/// Object-safe processor view consumed by [`ProcessorMixer`](crate::mixer::ProcessorMixer).
#[async_trait]
pub trait NodeProcessor<N>: Send + Sync
where
    N: Clone + Send + Sync + 'static,
{
    fn source(&self) -> DataSource;

    async fn is_authorized(&self, node: &N) -> Result<bool>;

    async fn filter(&self, nodes: &[N]) -> Result<Vec<N>>;

    async fn get_filter(&self) -> Result<MetadataFilter>;
}

#[async_trait]
impl<N, C> NodeProcessor<N> for AccessProcessor<N, C>
where
    N: Clone + Send + Sync + 'static,
    C: AccessCheck,
{
    fn source(&self) -> DataSource {
        self.check.source()
    }

    async fn is_authorized(&self, node: &N) -> Result<bool> {
        AccessProcessor::is_authorized(self, node).await
    }

    async fn filter(&self, nodes: &[N]) -> Result<Vec<N>> {
        AccessProcessor::filter(self, nodes).await
    }

    async fn get_filter(&self) -> Result<MetadataFilter> {
        AccessProcessor::get_filter(self).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::filter::FilterOperator;
    use crate::models::{keys, Document, DocumentAccess};

    /// Channel-style check: identity is a single text key.
    struct FakeCheck {
        shape: CheckShape,
        allowed: HashSet<String>,
        candidates: Vec<String>,
        checks: AtomicUsize,
        listings: AtomicUsize,
        fail_first: AtomicUsize,
        delay: Option<Duration>,
        forbidden: bool,
    }

    impl FakeCheck {
        fn new(shape: CheckShape, allowed: &[&str], candidates: &[&str]) -> Self {
            Self {
                shape,
                allowed: allowed.iter().map(|s| s.to_string()).collect(),
                candidates: candidates.iter().map(|s| s.to_string()).collect(),
                checks: AtomicUsize::new(0),
                listings: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
                delay: None,
                forbidden: false,
            }
        }
    }

    #[async_trait]
    impl AccessCheck for FakeCheck {
        fn source(&self) -> DataSource {
            DataSource::Slack
        }

        fn filter_key(&self) -> &str {
            keys::SLACK_CHANNEL_ID
        }

        fn principal(&self) -> &str {
            "alice@example.com"
        }

        fn shape(&self) -> CheckShape {
            self.shape
        }

        fn object_id(&self, metadata: &Metadata) -> Result<ObjectId> {
            crate::models::metadata_text(metadata, keys::SLACK_CHANNEL_ID).map(ObjectId::from)
        }

        async fn check(&self, object: &ObjectId) -> Result<bool> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.forbidden {
                return Err(MultipassError::insufficient(DataSource::Slack, object.to_string(), "HTTP 403"));
            }
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(MultipassError::unavailable(DataSource::Slack, object.to_string(), "HTTP 503"));
            }
            Ok(object.as_text().is_some_and(|id| self.allowed.contains(id)))
        }

        async fn list_objects(&self) -> Result<Vec<ObjectId>> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            let mut objects: Vec<ObjectId> = match self.shape {
                CheckShape::Direct => self.candidates.iter().map(|s| ObjectId::from(s.as_str())).collect(),
                CheckShape::Enumerate => self.allowed.iter().map(|s| ObjectId::from(s.as_str())).collect(),
            };
            objects.sort();
            Ok(objects)
        }
    }

    fn processor(check: FakeCheck) -> AccessProcessor<Document, FakeCheck> {
        AccessProcessor::new(check, Arc::new(DocumentAccess))
    }

    fn message(source: &str, channel: &str) -> Document {
        let mut md = Metadata::new();
        md.insert(keys::DATA_SOURCE.into(), source.into());
        md.insert(keys::SLACK_CHANNEL_ID.into(), channel.into());
        Document::new(format!("msg in {}", channel), md)
    }

    #[tokio::test]
    async fn test_has_access_twice_makes_one_call() {
        let p = processor(FakeCheck::new(CheckShape::Direct, &["C1"], &[]));
        let md = message("slack", "C1").metadata;
        assert!(p.has_access(&md).await.unwrap());
        assert!(p.has_access(&md).await.unwrap());
        assert_eq!(p.access_check().checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_collapse_to_one_call() {
        let mut check = FakeCheck::new(CheckShape::Direct, &["C1"], &[]);
        check.delay = Some(Duration::from_millis(20));
        let p = processor(check);
        let md = message("slack", "C1").metadata;

        let results = futures::future::join_all((0..16).map(|_| p.has_access(&md))).await;
        assert!(results.into_iter().all(|r| r.unwrap()));
        assert_eq!(p.access_check().checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_foreign_source_is_false_without_lookup() {
        let p = processor(FakeCheck::new(CheckShape::Direct, &["C1"], &[]));
        let slack = message("slack", "C1");
        assert!(p.is_authorized(&slack).await.unwrap());

        let foreign = message("confluence", "C1");
        assert!(!p.is_authorized(&foreign).await.unwrap());
        assert_eq!(p.access_check().checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_identity_key_is_an_error() {
        let p = processor(FakeCheck::new(CheckShape::Direct, &["C1"], &[]));
        let mut doc = message("slack", "C1");
        doc.metadata.remove(keys::SLACK_CHANNEL_ID);
        let err = p.is_authorized(&doc).await.unwrap_err();
        assert!(matches!(err, MultipassError::MissingMetadataKey { ref key } if key == keys::SLACK_CHANNEL_ID));
    }

    #[tokio::test]
    async fn test_missing_data_source_is_an_error() {
        let p = processor(FakeCheck::new(CheckShape::Direct, &["C1"], &[]));
        let mut doc = message("slack", "C1");
        doc.metadata.remove(keys::DATA_SOURCE);
        assert!(matches!(
            p.is_authorized(&doc).await,
            Err(MultipassError::MissingMetadataKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let check = FakeCheck::new(CheckShape::Direct, &["C1"], &[]);
        check.fail_first.store(1, Ordering::SeqCst);
        let p = processor(check);
        let md = message("slack", "C1").metadata;

        assert!(p.has_access(&md).await.unwrap_err().is_retryable());
        assert!(p.has_access(&md).await.unwrap());
        assert_eq!(p.access_check().checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_insufficient_permissions_is_not_a_deny() {
        let mut check = FakeCheck::new(CheckShape::Direct, &["C1"], &[]);
        check.forbidden = true;
        let p = processor(check);
        let err = p.filter(&[message("slack", "C1")]).await.unwrap_err();
        assert!(matches!(err, MultipassError::InsufficientPermissions { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded_is_source_unavailable() {
        let mut check = FakeCheck::new(CheckShape::Direct, &["C1"], &[]);
        check.delay = Some(Duration::from_secs(60));
        let p = processor(check).with_deadline(Duration::from_secs(1));
        let err = p.has_access(&message("slack", "C1").metadata).await.unwrap_err();
        assert!(matches!(err, MultipassError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_filter_preserves_order() {
        let p = processor(FakeCheck::new(CheckShape::Direct, &["C1", "C3"], &[]));
        let docs = vec![
            message("slack", "C3"),
            message("slack", "C2"),
            message("slack", "C1"),
            message("slack", "C3"),
        ];
        let kept = p.filter(&docs).await.unwrap();
        let ids: Vec<&str> = kept.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec![docs[0].id.as_str(), docs[2].id.as_str(), docs[3].id.as_str()]);
        assert_eq!(p.access_check().checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_enumeration_happens_once() {
        let p = processor(FakeCheck::new(CheckShape::Enumerate, &["C1", "C2"], &[]));
        let docs: Vec<Document> = ["C1", "C2", "C3", "C4", "C1"]
            .iter()
            .map(|c| message("slack", c))
            .collect();
        assert_eq!(p.filter(&docs).await.unwrap().len(), 3);
        p.get_filter().await.unwrap();
        assert_eq!(p.access_check().listings.load(Ordering::SeqCst), 1);
        assert_eq!(p.access_check().checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_filter_runs_on_spawned_tasks() {
        let docs = vec![message("slack", "C1"), message("slack", "C2")];

        let direct = Arc::new(processor(FakeCheck::new(CheckShape::Direct, &["C1"], &["C1", "C2"])));
        let task = {
            let (p, docs) = (Arc::clone(&direct), docs.clone());
            tokio::spawn(async move { (p.filter(&docs).await, p.get_filter().await) })
        };
        let (kept, filter) = task.await.unwrap();
        assert_eq!(kept.unwrap().len(), 1);
        assert_eq!(filter.unwrap().value, vec![ObjectId::from("C1")]);

        let boxed: Arc<dyn NodeProcessor<Document>> = direct;
        let task = tokio::spawn(async move { (boxed.filter(&docs).await, boxed.get_filter().await) });
        let (kept, filter) = task.await.unwrap();
        assert_eq!(kept.unwrap().len(), 1);
        assert_eq!(filter.unwrap().value.len(), 1);
    }

    #[tokio::test]
    async fn test_get_filter_complete_before_any_filter_call() {
        let p = processor(FakeCheck::new(CheckShape::Direct, &["C1", "C3"], &["C1", "C2", "C3"]));
        let filter = p.get_filter().await.unwrap();
        assert_eq!(filter.operator, FilterOperator::In);
        assert_eq!(filter.key, keys::SLACK_CHANNEL_ID);
        assert_eq!(filter.value.len(), 2);
        assert_eq!(p.cached_grants(), vec![ObjectId::from("C1"), ObjectId::from("C3")]);

        // Decisions made by get_filter are reused.
        assert!(p.has_access(&message("slack", "C3").metadata).await.unwrap());
        assert_eq!(p.access_check().checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_accessible_set_denies_everything() {
        let p = processor(FakeCheck::new(CheckShape::Enumerate, &[], &[]));
        let filter = p.get_filter().await.unwrap();
        assert!(filter.value.is_empty());

        for channel in ["C1", "C2", "C3"] {
            let doc = message("slack", channel);
            assert!(!p.has_access(&doc.metadata).await.unwrap());
            assert!(!filter.matches(&doc.metadata));
        }
    }
}
