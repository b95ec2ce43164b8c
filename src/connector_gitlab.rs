//! GitLab connector.
//!
//! Projects are scopes; files are listed with keyset-paginated tree pages
//! and the cursor is the `Link: rel="next"` URL. Access is checked per
//! project id with the admin token: `GET /projects/{id}/members/all/{user}`
//! answers 200 for members (direct or inherited) and 404 otherwise.

use async_trait::async_trait;
use multipass_core::models::metadata_text;
use multipass_core::reader::{NestedReader, Page, Scope, SourceListing};
use multipass_core::{
    keys, AccessCheck, CheckShape, DataSource, Document, Metadata, ObjectId, Result,
};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::{env_token, GitLabSourceConfig, HttpConfig};
use crate::http::{next_link, ApiClient, Auth};
use crate::path_filter::PathFilter;

#[derive(Debug, Clone, Deserialize)]
pub struct GitLabProject {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub path_with_namespace: String,
    pub default_branch: Option<String>,
}

impl Scope for GitLabProject {
    fn scope_id(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct TreeNode {
    name: String,
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct GitLabUser {
    id: u64,
}

#[derive(Debug, Clone)]
pub struct GitLabApi {
    client: ApiClient,
}

impl GitLabApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Projects the token is a member of, following `Link` headers.
    pub async fn list_projects(&self) -> Result<Vec<GitLabProject>> {
        let mut projects = Vec::new();
        let mut url = Some(self.client.url("projects?membership=true&simple=true&per_page=100"));
        while let Some(current) = url.take() {
            let response = self.client.send_ok(self.client.get(&current), "projects").await?;
            url = next_link(response.headers());
            let batch: Vec<GitLabProject> = self.client.decode(response, "projects").await?;
            projects.extend(batch);
        }
        debug!(projects = projects.len(), "listed gitlab projects");
        Ok(projects)
    }

    pub async fn find_user_id(&self, username: &str) -> Result<Option<u64>> {
        let request = self.client.get("users").query(&[("username", username)]);
        let users: Vec<GitLabUser> = self.client.json(request, "users").await?;
        Ok(users.first().map(|u| u.id))
    }

    pub async fn is_member(&self, project_id: &str, user_id: u64) -> Result<bool> {
        let path = format!("projects/{}/members/all/{}", project_id, user_id);
        let response = self.client.send(self.client.get(&path), &path).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.client.status_error(status, &path)),
        }
    }

    async fn raw_file(&self, project: &GitLabProject, path: &str) -> Result<Vec<u8>> {
        let project_id = project.id.to_string();
        let url = self.client.url_with_segments(&[
            "projects",
            &project_id,
            "repository",
            "files",
            path,
            "raw",
        ])?;
        let reference = project.default_branch.as_deref().unwrap_or("HEAD");
        let request = self.client.get(&url).query(&[("ref", reference)]);
        self.client.bytes(request, path).await
    }
}

pub struct GitLabListing {
    api: GitLabApi,
    paths: PathFilter,
}

impl GitLabListing {
    pub fn new(api: GitLabApi, paths: PathFilter) -> Self {
        Self { api, paths }
    }
}

#[async_trait]
impl SourceListing for GitLabListing {
    type Scope = GitLabProject;

    fn source(&self) -> DataSource {
        DataSource::GitLab
    }

    async fn list_scopes(&self) -> Result<Vec<GitLabProject>> {
        self.api.list_projects().await
    }

    async fn fetch_page(
        &self,
        project: &GitLabProject,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page> {
        let client = &self.api.client;
        let url = match cursor {
            Some(next) => next.to_string(),
            None => client.url(&format!(
                "projects/{}/repository/tree?recursive=true&per_page={}&pagination=keyset",
                project.id, page_size
            )),
        };
        let target = format!("projects/{}/repository/tree", project.id);
        let response = client.send(client.get(&url), &target).await?;
        if response.status() == StatusCode::NOT_FOUND {
            // Empty repositories have no tree.
            warn!(project = %project.path_with_namespace, "gitlab tree not found");
            return Ok(Page::last(Vec::new()));
        }
        if !response.status().is_success() {
            return Err(client.status_error(response.status(), &target));
        }
        let next_cursor = next_link(response.headers());
        let nodes: Vec<TreeNode> = client.decode(response, &target).await?;

        let mut documents = Vec::new();
        for node in nodes {
            if node.kind != "blob" || !self.paths.is_match(&node.path) {
                continue;
            }
            let content = self.api.raw_file(project, &node.path).await?;

            let mut metadata = Metadata::new();
            metadata.insert(keys::DATA_SOURCE.into(), DataSource::GitLab.as_str().into());
            metadata.insert(keys::GITLAB_REPOSITORY_ID.into(), project.id.to_string().into());
            metadata.insert(keys::GITLAB_REPOSITORY_NAME.into(), project.name.as_str().into());
            metadata.insert(
                keys::GITLAB_REPOSITORY_NAMESPACE_WITH_PATH.into(),
                project.path_with_namespace.as_str().into(),
            );
            metadata.insert(keys::FILE_PATH.into(), node.path.into());
            metadata.insert(keys::FILE_NAME.into(), node.name.into());
            documents.push(Document::new(content, metadata));
        }

        Ok(Page {
            documents,
            next_cursor,
        })
    }
}

/// Membership check for one GitLab user, resolved by username.
pub struct GitLabAccess {
    api: GitLabApi,
    username: String,
    user_id: OnceCell<Option<u64>>,
}

impl GitLabAccess {
    pub fn new(api: GitLabApi, username: impl Into<String>) -> Self {
        Self {
            api,
            username: username.into(),
            user_id: OnceCell::new(),
        }
    }

    async fn user_id(&self) -> Result<Option<u64>> {
        let id = self
            .user_id
            .get_or_try_init(|| async {
                let id = self.api.find_user_id(&self.username).await?;
                if id.is_none() {
                    warn!(username = %self.username, "gitlab user not found; denying all projects");
                }
                Ok::<_, multipass_core::MultipassError>(id)
            })
            .await?;
        Ok(*id)
    }
}

#[async_trait]
impl AccessCheck for GitLabAccess {
    fn source(&self) -> DataSource {
        DataSource::GitLab
    }

    fn filter_key(&self) -> &str {
        keys::GITLAB_REPOSITORY_ID
    }

    fn principal(&self) -> &str {
        &self.username
    }

    fn shape(&self) -> CheckShape {
        CheckShape::Direct
    }

    fn object_id(&self, metadata: &Metadata) -> Result<ObjectId> {
        metadata_text(metadata, keys::GITLAB_REPOSITORY_ID).map(ObjectId::from)
    }

    async fn check(&self, object: &ObjectId) -> Result<bool> {
        let Some(user_id) = self.user_id().await? else {
            return Ok(false);
        };
        self.api.is_member(&object.to_string(), user_id).await
    }

    async fn list_objects(&self) -> Result<Vec<ObjectId>> {
        Ok(self
            .api
            .list_projects()
            .await?
            .into_iter()
            .map(|p| ObjectId::from(p.id.to_string()))
            .collect())
    }
}

fn admin_api(config: &GitLabSourceConfig, http: &HttpConfig) -> anyhow::Result<GitLabApi> {
    let token = env_token(&config.admin_token_env)?;
    let client = ApiClient::new(DataSource::GitLab, &config.base_url, Auth::Bearer(token), http)?;
    Ok(GitLabApi::new(client))
}

pub fn reader(
    config: &GitLabSourceConfig,
    http: &HttpConfig,
) -> anyhow::Result<NestedReader<GitLabListing>> {
    let paths = PathFilter::new(&config.include_globs, &config.exclude_globs)?;
    Ok(NestedReader::new(GitLabListing::new(admin_api(config, http)?, paths)))
}

pub fn access(config: &GitLabSourceConfig, http: &HttpConfig) -> anyhow::Result<GitLabAccess> {
    Ok(GitLabAccess::new(admin_api(config, http)?, config.username.as_str()))
}
