//! GitHub connector.
//!
//! Reads every file of every repository the admin token can list, and checks
//! access per `(owner, repo)` pair.
//!
//! # Configuration
//!
//! ```toml
//! [sources.github]
//! admin_token_env = "GITHUB_ADMIN_TOKEN"
//! username = "octocat"              # collaborator check with the admin token
//! # user_token_env = "GITHUB_USER_TOKEN"   # or: repo visibility with the user's token
//! include_globs = ["**/*.md"]
//! ```
//!
//! # Access
//!
//! | Mode | Endpoint | Granted | Denied |
//! |------|----------|---------|--------|
//! | username | `GET /repos/{owner}/{repo}/collaborators/{user}` | 204 | 404 |
//! | user token | `GET /repos/{owner}/{repo}` | 200 | 404 |
//!
//! A 403 means the checking token cannot answer and surfaces as
//! `InsufficientPermissions`.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use multipass_core::models::metadata_text;
use multipass_core::reader::{NestedReader, Page, Scope, SourceListing};
use multipass_core::{
    keys, AccessCheck, CheckShape, DataSource, Document, Metadata, MetadataValue, MultipassError,
    ObjectId, Result,
};
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{env_token, GitHubSourceConfig, HttpConfig};
use crate::http::{ApiClient, Auth};
use crate::path_filter::PathFilter;

const PER_PAGE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubOwner {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRepo {
    pub id: u64,
    pub name: String,
    pub owner: GitHubOwner,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Scope for GitHubRepo {
    fn scope_id(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct BlobResponse {
    content: String,
    #[serde(default)]
    encoding: String,
}

/// Thin client over the REST endpoints the connector needs.
#[derive(Debug, Clone)]
pub struct GitHubApi {
    client: ApiClient,
}

impl GitHubApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(path)
            .header(ACCEPT, "application/vnd.github+json")
    }

    /// Every repository the token can see, following page numbers.
    pub async fn list_repos(&self) -> Result<Vec<GitHubRepo>> {
        let mut repos = Vec::new();
        let mut page = 1usize;
        loop {
            let request = self.get("user/repos").query(&[
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ]);
            let batch: Vec<GitHubRepo> = self.client.json(request, "user/repos").await?;
            let last = batch.len() < PER_PAGE;
            repos.extend(batch);
            if last {
                break;
            }
            page += 1;
        }
        debug!(repos = repos.len(), "listed github repositories");
        Ok(repos)
    }

    /// Blob entries of the default branch. Missing or empty repositories
    /// have no files.
    pub async fn tree(&self, repo: &GitHubRepo) -> Result<Vec<TreeEntry>> {
        let path = format!(
            "repos/{}/{}/git/trees/{}",
            repo.owner.login, repo.name, repo.default_branch
        );
        let request = self.get(&path).query(&[("recursive", "1")]);
        let response = self.client.send(request, &path).await?;
        match response.status() {
            StatusCode::OK => {
                let tree: TreeResponse = self.client.decode(response, &path).await?;
                if tree.truncated {
                    warn!(repo = %repo.name, "github tree truncated; some files will be missing");
                }
                Ok(tree.tree.into_iter().filter(|e| e.kind == "blob").collect())
            }
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(Vec::new()),
            status => Err(self.client.status_error(status, &path)),
        }
    }

    pub async fn blob(&self, repo: &GitHubRepo, sha: &str) -> Result<Vec<u8>> {
        let path = format!("repos/{}/{}/git/blobs/{}", repo.owner.login, repo.name, sha);
        let blob: BlobResponse = self.client.json(self.get(&path), &path).await?;
        if blob.encoding != "base64" {
            return Ok(blob.content.into_bytes());
        }
        let packed: String = blob.content.split_whitespace().collect();
        base64::engine::general_purpose::STANDARD
            .decode(packed)
            .map_err(|e| MultipassError::unavailable(DataSource::GitHub, path, e.to_string()))
    }

    /// Whether this token can see the repository.
    pub async fn repo_visible(&self, owner: &str, name: &str) -> Result<bool> {
        let path = format!("repos/{}/{}", owner, name);
        let response = self.client.send(self.get(&path), &path).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.client.status_error(status, &path)),
        }
    }

    /// Whether `username` is a collaborator, asked with this (admin) token.
    pub async fn is_collaborator(&self, owner: &str, name: &str, username: &str) -> Result<bool> {
        let path = format!("repos/{}/{}/collaborators/{}", owner, name, username);
        let response = self.client.send(self.get(&path), &path).await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.client.status_error(status, &path)),
        }
    }

    pub fn fingerprint(&self) -> String {
        self.client.fingerprint()
    }
}

/// Repositories as scopes; cursors are offsets into the filtered tree.
pub struct GitHubListing {
    api: GitHubApi,
    paths: PathFilter,
    tree: Mutex<Option<(u64, Arc<Vec<TreeEntry>>)>>,
}

impl GitHubListing {
    pub fn new(api: GitHubApi, paths: PathFilter) -> Self {
        Self {
            api,
            paths,
            tree: Mutex::new(None),
        }
    }

    /// The filtered tree of `repo`, fetched once while the repo is current.
    async fn files(&self, repo: &GitHubRepo) -> Result<Arc<Vec<TreeEntry>>> {
        let mut cached = self.tree.lock().await;
        if let Some((id, entries)) = cached.as_ref() {
            if *id == repo.id {
                return Ok(Arc::clone(entries));
            }
        }
        let entries: Vec<TreeEntry> = self
            .api
            .tree(repo)
            .await?
            .into_iter()
            .filter(|e| self.paths.is_match(&e.path))
            .collect();
        let entries = Arc::new(entries);
        *cached = Some((repo.id, Arc::clone(&entries)));
        Ok(entries)
    }
}

fn document(repo: &GitHubRepo, entry: &TreeEntry, content: Vec<u8>) -> Document {
    let file_name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
    let mut metadata = Metadata::new();
    metadata.insert(keys::DATA_SOURCE.into(), DataSource::GitHub.as_str().into());
    metadata.insert(keys::GITHUB_REPOSITORY_OWNER.into(), repo.owner.login.as_str().into());
    metadata.insert(keys::GITHUB_REPOSITORY_NAME.into(), repo.name.as_str().into());
    metadata.insert(
        keys::GITHUB_REPOSITORY_OWNER_AND_NAME.into(),
        MetadataValue::tuple([repo.owner.login.as_str(), repo.name.as_str()]),
    );
    metadata.insert(keys::FILE_PATH.into(), entry.path.as_str().into());
    metadata.insert(keys::FILE_NAME.into(), file_name.into());
    Document::new(content, metadata)
}

#[async_trait]
impl SourceListing for GitHubListing {
    type Scope = GitHubRepo;

    fn source(&self) -> DataSource {
        DataSource::GitHub
    }

    async fn list_scopes(&self) -> Result<Vec<GitHubRepo>> {
        self.api.list_repos().await
    }

    async fn fetch_page(
        &self,
        repo: &GitHubRepo,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page> {
        let files = self.files(repo).await?;
        let start = cursor
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(files.len());
        let end = (start + page_size).min(files.len());

        let mut documents = Vec::with_capacity(end - start);
        for entry in &files[start..end] {
            let content = self.api.blob(repo, &entry.sha).await?;
            documents.push(document(repo, entry, content));
        }

        Ok(Page {
            documents,
            next_cursor: (end < files.len()).then(|| end.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
enum Mode {
    Collaborator { username: String },
    Token,
}

/// Access check for one GitHub user.
pub struct GitHubAccess {
    api: GitHubApi,
    mode: Mode,
    principal: String,
}

impl GitHubAccess {
    /// Ask about `username` with an admin token.
    pub fn for_user(api: GitHubApi, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            api,
            principal: username.clone(),
            mode: Mode::Collaborator { username },
        }
    }

    /// Ask with the user's own token.
    pub fn for_token(api: GitHubApi) -> Self {
        Self {
            principal: api.fingerprint(),
            api,
            mode: Mode::Token,
        }
    }
}

#[async_trait]
impl AccessCheck for GitHubAccess {
    fn source(&self) -> DataSource {
        DataSource::GitHub
    }

    fn filter_key(&self) -> &str {
        keys::GITHUB_REPOSITORY_OWNER_AND_NAME
    }

    fn principal(&self) -> &str {
        &self.principal
    }

    fn shape(&self) -> CheckShape {
        CheckShape::Direct
    }

    fn object_id(&self, metadata: &Metadata) -> Result<ObjectId> {
        let owner = metadata_text(metadata, keys::GITHUB_REPOSITORY_OWNER)?;
        let name = metadata_text(metadata, keys::GITHUB_REPOSITORY_NAME)?;
        Ok(MetadataValue::tuple([owner, name]))
    }

    async fn check(&self, object: &ObjectId) -> Result<bool> {
        let [owner, name] = object.parts() else {
            return Err(MultipassError::InvalidMetadata {
                key: keys::GITHUB_REPOSITORY_OWNER_AND_NAME.to_string(),
                reason: format!("expected (owner, repo), found {}", object),
            });
        };
        match &self.mode {
            Mode::Collaborator { username } => self.api.is_collaborator(owner, name, username).await,
            Mode::Token => self.api.repo_visible(owner, name).await,
        }
    }

    async fn list_objects(&self) -> Result<Vec<ObjectId>> {
        Ok(self
            .api
            .list_repos()
            .await?
            .into_iter()
            .map(|repo| MetadataValue::tuple([repo.owner.login, repo.name]))
            .collect())
    }
}

pub fn reader(
    config: &GitHubSourceConfig,
    http: &HttpConfig,
) -> anyhow::Result<NestedReader<GitHubListing>> {
    let token = env_token(&config.admin_token_env)?;
    let client = ApiClient::new(DataSource::GitHub, &config.base_url, Auth::Token(token), http)?;
    let paths = PathFilter::new(&config.include_globs, &config.exclude_globs)?;
    Ok(NestedReader::new(GitHubListing::new(GitHubApi::new(client), paths)))
}

pub fn access(config: &GitHubSourceConfig, http: &HttpConfig) -> anyhow::Result<GitHubAccess> {
    match (&config.username, &config.user_token_env) {
        (Some(username), _) => {
            let token = env_token(&config.admin_token_env)?;
            let client = ApiClient::new(DataSource::GitHub, &config.base_url, Auth::Token(token), http)?;
            Ok(GitHubAccess::for_user(GitHubApi::new(client), username.as_str()))
        }
        (None, Some(user_env)) => {
            let token = env_token(user_env)?;
            let client = ApiClient::new(DataSource::GitHub, &config.base_url, Auth::Token(token), http)?;
            Ok(GitHubAccess::for_token(GitHubApi::new(client)))
        }
        (None, None) => anyhow::bail!("sources.github needs either username or user_token_env"),
    }
}
