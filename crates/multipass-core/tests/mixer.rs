//! Multi-source filtering through the processor mixer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use multipass_core::models::metadata_text;
use multipass_core::{
    keys, AccessCheck, AccessProcessor, CheckShape, DataSource, Document, DocumentAccess, Metadata,
    MetadataFilters, MultipassError, NodeProcessor, ObjectId, ProcessorMixer, Result,
};

/// Identity is one text key; `allowed` is what the principal may see.
struct StaticCheck {
    source: DataSource,
    key: &'static str,
    shape: CheckShape,
    allowed: HashSet<String>,
    candidates: Vec<String>,
    calls: Arc<AtomicUsize>,
    broken: bool,
}

impl StaticCheck {
    fn new(source: DataSource, key: &'static str, shape: CheckShape, allowed: &[&str]) -> Self {
        Self {
            source,
            key,
            shape,
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
            candidates: Vec::new(),
            calls: Arc::new(AtomicUsize::new(0)),
            broken: false,
        }
    }
}

#[async_trait]
impl AccessCheck for StaticCheck {
    fn source(&self) -> DataSource {
        self.source
    }

    fn filter_key(&self) -> &str {
        self.key
    }

    fn principal(&self) -> &str {
        "user@example.com"
    }

    fn shape(&self) -> CheckShape {
        self.shape
    }

    fn object_id(&self, metadata: &Metadata) -> Result<ObjectId> {
        metadata_text(metadata, self.key).map(ObjectId::from)
    }

    async fn check(&self, object: &ObjectId) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(MultipassError::unavailable(self.source, object.to_string(), "HTTP 500"));
        }
        Ok(object.as_text().is_some_and(|id| self.allowed.contains(id)))
    }

    async fn list_objects(&self) -> Result<Vec<ObjectId>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ids = match self.shape {
            CheckShape::Enumerate => {
                let mut ids: Vec<&String> = self.allowed.iter().collect();
                ids.sort();
                ids.into_iter().cloned().collect()
            }
            CheckShape::Direct => self.candidates.clone(),
        };
        Ok(ids.into_iter().map(ObjectId::from).collect())
    }
}

fn boxed(check: StaticCheck) -> Box<dyn NodeProcessor<Document>> {
    Box::new(AccessProcessor::new(check, Arc::new(DocumentAccess)))
}

fn doc(source: DataSource, key: &str, id: &str) -> Document {
    let mut md = Metadata::new();
    md.insert(keys::DATA_SOURCE.into(), source.as_str().into());
    md.insert(key.into(), id.into());
    Document::new(format!("{} {}", source, id), md)
}

/// 12 Slack messages over channels C1 (3), C2 (4), C3 (5) plus 4 Confluence
/// pages. The user sees C1 and C2 and pages 10 and 12.
fn corpus() -> Vec<Document> {
    let mut docs = Vec::new();
    for (channel, count) in [("C1", 3), ("C2", 4), ("C3", 5)] {
        for _ in 0..count {
            docs.push(doc(DataSource::Slack, keys::SLACK_CHANNEL_ID, channel));
        }
    }
    for page in ["10", "11", "12", "13"] {
        docs.push(doc(DataSource::Confluence, keys::CONFLUENCE_PAGE_ID, page));
    }
    docs
}

fn slack() -> StaticCheck {
    StaticCheck::new(DataSource::Slack, keys::SLACK_CHANNEL_ID, CheckShape::Enumerate, &["C1", "C2"])
}

fn confluence() -> StaticCheck {
    StaticCheck::new(
        DataSource::Confluence,
        keys::CONFLUENCE_PAGE_ID,
        CheckShape::Enumerate,
        &["10", "12"],
    )
}

#[tokio::test]
async fn test_mixed_sources_partition() {
    let docs = corpus();
    let mut mixer = ProcessorMixer::new(vec![boxed(slack()), boxed(confluence())]);

    assert!(mixer.authorized_documents().is_empty());
    assert!(mixer.unauthorized_documents().is_empty());

    let kept = mixer.filter(&docs).await.unwrap();
    assert_eq!(kept.len(), 7 + 2);
    assert_eq!(mixer.authorized_documents().len(), 9);
    assert_eq!(mixer.unauthorized_documents().len(), 5 + 2);

    let slack_kept = kept
        .iter()
        .filter(|d| d.data_source() == Some(DataSource::Slack))
        .count();
    assert_eq!(slack_kept, 7);

    // Every input lands in exactly one partition.
    let mut ids: Vec<&str> = mixer
        .authorized_documents()
        .iter()
        .chain(mixer.unauthorized_documents())
        .map(|d| d.id.as_str())
        .collect();
    ids.sort();
    let mut expected: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_fully_visible_source_withholds_only_the_other() {
    // 12 messages over four channels; the user sees C1, C2 and C3 (7 messages)
    // and every Confluence page.
    let mut docs = Vec::new();
    for (channel, count) in [("C1", 3), ("C2", 2), ("C3", 2), ("C4", 5)] {
        for _ in 0..count {
            docs.push(doc(DataSource::Slack, keys::SLACK_CHANNEL_ID, channel));
        }
    }
    let pages = ["10", "11", "12"];
    for page in pages {
        docs.push(doc(DataSource::Confluence, keys::CONFLUENCE_PAGE_ID, page));
    }

    let slack = StaticCheck::new(
        DataSource::Slack,
        keys::SLACK_CHANNEL_ID,
        CheckShape::Enumerate,
        &["C1", "C2", "C3"],
    );
    let confluence = StaticCheck::new(DataSource::Confluence, keys::CONFLUENCE_PAGE_ID, CheckShape::Enumerate, &pages);
    let mut mixer = ProcessorMixer::new(vec![boxed(slack), boxed(confluence)]);

    let kept = mixer.filter(&docs).await.unwrap();
    assert_eq!(kept.len(), 7 + pages.len());

    let withheld = mixer.unauthorized_documents();
    assert_eq!(withheld.len(), 12 - 7);
    assert!(withheld.iter().all(|d| d.data_source() == Some(DataSource::Slack)
        && d.metadata[keys::SLACK_CHANNEL_ID].as_text() == Some("C4")));
}

#[tokio::test]
async fn test_filter_runs_on_a_spawned_task() {
    let docs = corpus();
    let mut mixer = ProcessorMixer::new(vec![boxed(slack()), boxed(confluence())]);
    let task = tokio::spawn(async move {
        let kept = mixer.filter(&docs).await.map(|kept| kept.len());
        (kept, mixer.unauthorized_documents().len())
    });
    let (kept, withheld) = task.await.unwrap();
    assert_eq!(kept.unwrap(), 9);
    assert_eq!(withheld, 7);
}

#[tokio::test]
async fn test_filter_replaces_previous_partitions() {
    let docs = corpus();
    let mut mixer = ProcessorMixer::new(vec![boxed(slack()), boxed(confluence())]);
    mixer.filter(&docs).await.unwrap();
    mixer.filter(&docs[..3]).await.unwrap();
    assert_eq!(mixer.authorized_documents().len(), 3);
    assert!(mixer.unauthorized_documents().is_empty());
}

#[tokio::test]
async fn test_filters_match_filter_decisions() {
    let docs = corpus();
    let mut mixer = ProcessorMixer::new(vec![boxed(slack()), boxed(confluence())]);
    let filters = mixer.get_filters().await.unwrap();
    assert_eq!(filters.len(), 2);
    assert_eq!(filters[0].key, keys::SLACK_CHANNEL_ID);
    assert_eq!(filters[1].key, keys::CONFLUENCE_PAGE_ID);

    let predicate = MetadataFilters::any(filters);
    let kept: HashSet<String> = mixer
        .filter(&docs)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    for d in &docs {
        assert_eq!(predicate.matches(&d.metadata), kept.contains(&d.id), "{}", d.id);
    }
}

#[tokio::test]
async fn test_or_across_processors_of_same_source() {
    // A user check that sees C1 backed by a broader check that sees C3.
    let user = slack();
    let mut admin = StaticCheck::new(DataSource::Slack, keys::SLACK_CHANNEL_ID, CheckShape::Direct, &["C3"]);
    admin.candidates = vec!["C3".into()];
    let admin_calls = Arc::clone(&admin.calls);

    let mut mixer = ProcessorMixer::new(vec![boxed(user), boxed(admin)]);
    let docs = corpus();
    let kept = mixer.filter(&docs[..12]).await.unwrap();
    assert_eq!(kept.len(), 12);

    // The second processor is only consulted for what the first denied.
    assert_eq!(admin_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_error_surfaces_and_leaves_partitions_empty() {
    let mut broken = StaticCheck::new(DataSource::Confluence, keys::CONFLUENCE_PAGE_ID, CheckShape::Direct, &[]);
    broken.broken = true;

    let mut mixer = ProcessorMixer::new(vec![boxed(slack()), boxed(broken)]);
    let err = mixer.filter(&corpus()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(mixer.authorized_documents().is_empty());
    assert!(mixer.unauthorized_documents().is_empty());
}

#[tokio::test]
async fn test_no_processors_denies_everything() {
    let mut mixer: ProcessorMixer<Document> = ProcessorMixer::new(Vec::new());
    let docs = corpus();
    assert!(mixer.filter(&docs).await.unwrap().is_empty());
    assert_eq!(mixer.unauthorized_documents().len(), docs.len());

    let predicate = MetadataFilters::any(mixer.get_filters().await.unwrap());
    assert!(docs.iter().all(|d| !predicate.matches(&d.metadata)));
}
