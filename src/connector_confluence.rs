//! Confluence Cloud connector (REST v2).
//!
//! Spaces are scopes and pages are documents, read with the admin
//! credential. Access is enumerated with the user's own credential: the set
//! of page ids the user can list is exactly what they may read.

use async_trait::async_trait;
use multipass_core::models::metadata_text;
use multipass_core::reader::{NestedReader, Page, Scope, SourceListing};
use multipass_core::{
    keys, AccessCheck, CheckShape, DataSource, Document, Metadata, ObjectId, Result,
};
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::config::{env_token, ConfluenceSourceConfig, HttpConfig};
use crate::http::{ApiClient, Auth};

#[derive(Debug, Clone, Deserialize)]
pub struct ConfluenceSpace {
    pub id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
}

impl Scope for ConfluenceSpace {
    fn scope_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(rename = "_links", default)]
    links: Links,
}

#[derive(Debug, Deserialize)]
struct Storage {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct Body {
    storage: Option<Storage>,
}

#[derive(Debug, Deserialize)]
struct ConfluencePage {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(rename = "spaceId", default)]
    space_id: String,
    body: Option<Body>,
}

#[derive(Debug, Deserialize)]
struct PageRef {
    id: String,
}

#[derive(Debug, Clone)]
pub struct ConfluenceApi {
    client: ApiClient,
}

impl ConfluenceApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// `_links.next` is site-relative (`/wiki/api/v2/...`).
    fn resolve(&self, next: Option<String>) -> Option<String> {
        let next = next?;
        let base = Url::parse(self.client.base_url()).ok()?;
        base.join(&next).ok().map(String::from)
    }

    async fn all<T: serde::de::DeserializeOwned>(&self, first: String, target: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut url = Some(first);
        while let Some(current) = url.take() {
            let page: Listing<T> = self.client.json(self.client.get(&current), target).await?;
            items.extend(page.results);
            url = self.resolve(page.links.next);
        }
        Ok(items)
    }

    pub async fn spaces(&self) -> Result<Vec<ConfluenceSpace>> {
        self.all(self.client.url("api/v2/spaces?limit=250"), "spaces").await
    }

    /// Ids of every page this credential can list.
    pub async fn visible_page_ids(&self) -> Result<Vec<String>> {
        let pages: Vec<PageRef> = self.all(self.client.url("api/v2/pages?limit=250"), "pages").await?;
        Ok(pages.into_iter().map(|p| p.id).collect())
    }
}

pub struct ConfluenceListing {
    api: ConfluenceApi,
    spaces: Vec<String>,
}

impl ConfluenceListing {
    /// `spaces` limits reading to these space ids or keys; empty reads all.
    pub fn new(api: ConfluenceApi, spaces: Vec<String>) -> Self {
        Self { api, spaces }
    }
}

#[async_trait]
impl SourceListing for ConfluenceListing {
    type Scope = ConfluenceSpace;

    fn source(&self) -> DataSource {
        DataSource::Confluence
    }

    async fn list_scopes(&self) -> Result<Vec<ConfluenceSpace>> {
        let spaces = self.api.spaces().await?;
        if self.spaces.is_empty() {
            return Ok(spaces);
        }
        Ok(spaces
            .into_iter()
            .filter(|s| self.spaces.iter().any(|wanted| *wanted == s.id || *wanted == s.key))
            .collect())
    }

    async fn fetch_page(
        &self,
        space: &ConfluenceSpace,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page> {
        let client = &self.api.client;
        let url = match cursor {
            Some(next) => next.to_string(),
            None => client.url(&format!(
                "api/v2/spaces/{}/pages?limit={}&body-format=storage",
                space.id,
                page_size.min(250)
            )),
        };
        let listing: Listing<ConfluencePage> = client.json(client.get(&url), &space.key).await?;
        debug!(space = %space.key, pages = listing.results.len(), "fetched confluence pages");

        let documents = listing
            .results
            .into_iter()
            .map(|page| {
                let content = page
                    .body
                    .and_then(|b| b.storage)
                    .map(|s| s.value)
                    .unwrap_or_default();
                let space_id = if page.space_id.is_empty() {
                    space.id.clone()
                } else {
                    page.space_id
                };
                let mut metadata = Metadata::new();
                metadata.insert(keys::DATA_SOURCE.into(), DataSource::Confluence.as_str().into());
                metadata.insert(keys::CONFLUENCE_PAGE_ID.into(), page.id.into());
                metadata.insert(keys::CONFLUENCE_SPACE_ID.into(), space_id.into());
                metadata.insert(keys::FILE_NAME.into(), page.title.into());
                Document::new(content, metadata)
            })
            .collect();

        Ok(Page {
            documents,
            next_cursor: self.api.resolve(listing.links.next),
        })
    }
}

/// Pages visible to one Confluence user, asked with their credential.
pub struct ConfluenceAccess {
    api: ConfluenceApi,
    user_email: String,
}

impl ConfluenceAccess {
    pub fn new(api: ConfluenceApi, user_email: impl Into<String>) -> Self {
        Self {
            api,
            user_email: user_email.into(),
        }
    }
}

#[async_trait]
impl AccessCheck for ConfluenceAccess {
    fn source(&self) -> DataSource {
        DataSource::Confluence
    }

    fn filter_key(&self) -> &str {
        keys::CONFLUENCE_PAGE_ID
    }

    fn principal(&self) -> &str {
        &self.user_email
    }

    fn shape(&self) -> CheckShape {
        CheckShape::Enumerate
    }

    fn object_id(&self, metadata: &Metadata) -> Result<ObjectId> {
        metadata_text(metadata, keys::CONFLUENCE_PAGE_ID).map(ObjectId::from)
    }

    async fn check(&self, object: &ObjectId) -> Result<bool> {
        Ok(self.list_objects().await?.contains(object))
    }

    async fn list_objects(&self) -> Result<Vec<ObjectId>> {
        Ok(self
            .api
            .visible_page_ids()
            .await?
            .into_iter()
            .map(ObjectId::from)
            .collect())
    }
}

pub fn reader(
    config: &ConfluenceSourceConfig,
    http: &HttpConfig,
) -> anyhow::Result<NestedReader<ConfluenceListing>> {
    let auth = Auth::Basic {
        user: config.admin_email.clone(),
        secret: env_token(&config.admin_token_env)?,
    };
    let client = ApiClient::new(DataSource::Confluence, &config.base_url, auth, http)?;
    Ok(NestedReader::new(ConfluenceListing::new(
        ConfluenceApi::new(client),
        config.spaces.clone(),
    )))
}

pub fn access(config: &ConfluenceSourceConfig, http: &HttpConfig) -> anyhow::Result<ConfluenceAccess> {
    let auth = Auth::Basic {
        user: config.user_email.clone(),
        secret: env_token(&config.user_token_env)?,
    };
    let client = ApiClient::new(DataSource::Confluence, &config.base_url, auth, http)?;
    Ok(ConfluenceAccess::new(ConfluenceApi::new(client), config.user_email.as_str()))
}
