//! Core data models used throughout Multipass.
//!
//! A [`Document`] is the uniform unit that flows from a source reader,
//! through metadata enrichers, into the document store and finally through
//! access processors at query time. Everything the authorization layer needs
//! lives in its string-keyed [`Metadata`].

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MultipassError, Result};

/// Metadata keys written by readers and enrichers, named once for every
/// connector.
pub mod keys {
    pub const DATA_SOURCE: &str = "data_source";
    pub const FILE_PATH: &str = "file_path";
    pub const FILE_NAME: &str = "file_name";
    pub const CONTENT_HASH: &str = "content_hash";

    pub const GITHUB_REPOSITORY_OWNER: &str = "github_repository_owner";
    pub const GITHUB_REPOSITORY_NAME: &str = "github_repository_name";
    pub const GITHUB_REPOSITORY_OWNER_AND_NAME: &str = "github_repository_owner_and_name";

    pub const GITLAB_REPOSITORY_ID: &str = "gitlab_repository_id";
    pub const GITLAB_REPOSITORY_NAME: &str = "gitlab_repository_name";
    pub const GITLAB_REPOSITORY_NAMESPACE_WITH_PATH: &str = "gitlab_repository_namespace_with_path";

    pub const SLACK_CHANNEL_ID: &str = "slack_channel_id";
    pub const SLACK_CHANNEL_NAME: &str = "slack_channel_name";
    pub const SLACK_TIMESTAMP: &str = "slack_timestamp";
    pub const SLACK_USER: &str = "slack_user";

    pub const DROPBOX_ID: &str = "dropbox_id";
    pub const DROPBOX_SHARED_FOLDER_ID: &str = "dropbox_shared_folder_id";
    pub const DROPBOX_FOLDER_ID: &str = "dropbox_folder_id";

    pub const ONEDRIVE_ID: &str = "onedrive_id";

    pub const CONFLUENCE_PAGE_ID: &str = "confluence_page_id";
    pub const CONFLUENCE_SPACE_ID: &str = "confluence_space_id";

    pub const JIRA_ISSUE_ID: &str = "jira_issue_id";
    pub const JIRA_ISSUE_KEY: &str = "jira_issue_key";
    pub const JIRA_PROJECT_KEY: &str = "jira_project_key";

    pub const GDRIVE_FILE_ID: &str = "gdrive_file_id";
    pub const GDRIVE_PARENT_IDS: &str = "gdrive_parent_ids";
    pub const GDRIVE_OWNERS: &str = "gdrive_owners";
}

/// The external system a document was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    GitHub,
    GitLab,
    Slack,
    Dropbox,
    OneDrive,
    Confluence,
    Jira,
    GDrive,
}

impl DataSource {
    pub const ALL: [DataSource; 8] = [
        DataSource::GitHub,
        DataSource::GitLab,
        DataSource::Slack,
        DataSource::Dropbox,
        DataSource::OneDrive,
        DataSource::Confluence,
        DataSource::Jira,
        DataSource::GDrive,
    ];

    /// Tag stored under [`keys::DATA_SOURCE`].
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::GitHub => "github",
            DataSource::GitLab => "gitlab",
            DataSource::Slack => "slack",
            DataSource::Dropbox => "dropbox",
            DataSource::OneDrive => "onedrive",
            DataSource::Confluence => "confluence",
            DataSource::Jira => "jira",
            DataSource::GDrive => "gdrive",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        DataSource::ALL
            .iter()
            .copied()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown data source '{}'. Expected one of: {}",
                    s,
                    DataSource::ALL.map(|d| d.as_str()).join(", ")
                )
            })
    }
}

/// A single metadata value.
///
/// `Tuple` marks composite identities such as a GitHub `(owner, repo)` pair.
/// It serializes as a plain JSON array, so after a round trip through a
/// document store it comes back as `List`; filter matching compares both by
/// their parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Text(String),
    List(Vec<String>),
    Tuple(Vec<String>),
}

impl MetadataValue {
    pub fn tuple<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MetadataValue::Tuple(parts.into_iter().map(Into::into).collect())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a slice of string parts (one part for `Text`).
    pub fn parts(&self) -> &[String] {
        match self {
            MetadataValue::Text(s) => std::slice::from_ref(s),
            MetadataValue::List(parts) | MetadataValue::Tuple(parts) => parts,
        }
    }

    /// True for an empty string or an empty list/tuple.
    pub fn is_empty(&self) -> bool {
        match self {
            MetadataValue::Text(s) => s.is_empty(),
            MetadataValue::List(parts) | MetadataValue::Tuple(parts) => parts.is_empty(),
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Text(s) => f.write_str(s),
            MetadataValue::List(parts) => write!(f, "[{}]", parts.join(", ")),
            MetadataValue::Tuple(parts) => write!(f, "({})", parts.join(", ")),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(value: Vec<String>) -> Self {
        MetadataValue::List(value)
    }
}

/// String-keyed document metadata.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Read a required text value, failing with `MissingMetadataKey` when the key
/// is absent or empty.
pub fn metadata_text<'a>(metadata: &'a Metadata, key: &str) -> Result<&'a str> {
    match metadata.get(key) {
        None => Err(MultipassError::missing_key(key)),
        Some(value) if value.is_empty() => Err(MultipassError::missing_key(key)),
        Some(MetadataValue::Text(s)) => Ok(s),
        Some(other) => Err(MultipassError::InvalidMetadata {
            key: key.to_string(),
            reason: format!("expected text, found {}", other),
        }),
    }
}

/// The `data_source` tag of a document. Absence is a malformed document.
pub fn data_source_tag(metadata: &Metadata) -> Result<&str> {
    metadata_text(metadata, keys::DATA_SOURCE)
}

/// Document payload. Some sources return raw bytes, others decoded text; the
/// model keeps whatever the source produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Bytes(Vec<u8>),
}

impl Content {
    /// Text view of the payload; bytes are decoded lossily.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Content::Text(s) => Cow::Borrowed(s),
            Content::Bytes(b) => String::from_utf8_lossy(b),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Content::Text(s) => s.as_bytes(),
            Content::Bytes(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value)
    }
}

impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Content::Bytes(value)
    }
}

/// The uniform unit produced by readers and checked by processors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Random identifier assigned at creation, independent of content.
    pub id: String,
    pub content: Content,
    pub metadata: Metadata,
}

impl Document {
    pub fn new(content: impl Into<Content>, metadata: Metadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            metadata,
        }
    }

    /// The source that produced this document, if tagged with a known one.
    pub fn data_source(&self) -> Option<DataSource> {
        self.metadata
            .get(keys::DATA_SOURCE)
            .and_then(MetadataValue::as_text)
            .and_then(|tag| tag.parse().ok())
    }
}

/// Projection from an arbitrary node type to its metadata.
///
/// Processors are constructed with one of these so the engine never depends
/// on a concrete framework node type.
pub trait MetadataAccessor<N>: Send + Sync {
    fn metadata<'a>(&self, node: &'a N) -> Cow<'a, Metadata>;
}

impl<N, F> MetadataAccessor<N> for F
where
    F: Fn(&N) -> Metadata + Send + Sync,
{
    fn metadata<'a>(&self, node: &'a N) -> Cow<'a, Metadata> {
        Cow::Owned(self(node))
    }
}

/// Read/write access to a node's content and metadata, used by enrichment.
pub trait DocumentReader<N>: Send + Sync {
    /// Raw content; binary payloads are not decoded.
    fn read<'a>(&self, node: &'a N) -> Cow<'a, [u8]>;
    fn metadata<'a>(&self, node: &'a N) -> &'a Metadata;
    fn metadata_mut<'a>(&self, node: &'a mut N) -> &'a mut Metadata;
}

/// Accessor for this crate's own [`Document`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentAccess;

impl MetadataAccessor<Document> for DocumentAccess {
    fn metadata<'a>(&self, node: &'a Document) -> Cow<'a, Metadata> {
        Cow::Borrowed(&node.metadata)
    }
}

impl DocumentReader<Document> for DocumentAccess {
    fn read<'a>(&self, node: &'a Document) -> Cow<'a, [u8]> {
        Cow::Borrowed(node.content.as_bytes())
    }

    fn metadata<'a>(&self, node: &'a Document) -> &'a Metadata {
        &node.metadata
    }

    fn metadata_mut<'a>(&self, node: &'a mut Document) -> &'a mut Metadata {
        &mut node.metadata
    }
}
