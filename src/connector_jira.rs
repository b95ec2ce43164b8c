//! Jira Cloud connector (REST v2).
//!
//! One JQL query is read with an offset (`startAt`) cursor; each issue
//! becomes a document holding its summary and description. Access is checked
//! per issue by fetching it with the user's own credential: 200 means
//! visible, 404 means the issue does not exist for them.

use async_trait::async_trait;
use multipass_core::enrich::MetadataEnricher;
use multipass_core::models::metadata_text;
use multipass_core::reader::{NestedReader, Page, Scope, SourceListing};
use multipass_core::{
    keys, AccessCheck, CheckShape, DataSource, Document, Metadata, ObjectId, Result,
};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::config::{env_token, HttpConfig, JiraSourceConfig};
use crate::http::{ApiClient, Auth};

const SEARCH_FIELDS: &str = "summary,description";
const MAX_RESULTS: usize = 100;

/// A JQL query; the only scope a Jira reader has.
#[derive(Debug, Clone)]
pub struct JqlQuery {
    pub jql: String,
}

impl Scope for JqlQuery {
    fn scope_id(&self) -> String {
        self.jql.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
struct IssueFields {
    #[serde(default)]
    summary: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Issue {
    id: String,
    key: String,
    #[serde(default)]
    fields: IssueFields,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "startAt", default)]
    start_at: usize,
    #[serde(default)]
    total: usize,
    #[serde(default)]
    issues: Vec<Issue>,
}

impl SearchResponse {
    /// Offset of the next page, or `None` once `total` is reached.
    fn next_start(&self) -> Option<usize> {
        let next = self.start_at + self.issues.len();
        (!self.issues.is_empty() && next < self.total).then_some(next)
    }
}

/// The project key of an issue key (`OPS-42` -> `OPS`).
pub fn project_key(issue_key: &str) -> Option<&str> {
    issue_key
        .rsplit_once('-')
        .map(|(project, _)| project)
        .filter(|p| !p.is_empty())
}

#[derive(Debug, Clone)]
pub struct JiraApi {
    client: ApiClient,
}

impl JiraApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    async fn search(&self, jql: &str, start_at: usize, max_results: usize, fields: &str) -> Result<SearchResponse> {
        let request = self.client.get("rest/api/2/search").query(&[
            ("jql", jql.to_string()),
            ("startAt", start_at.to_string()),
            ("maxResults", max_results.to_string()),
            ("fields", fields.to_string()),
        ]);
        self.client.json(request, "search").await
    }

    /// Ids of every issue `jql` matches for this credential.
    pub async fn issue_ids(&self, jql: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut start = Some(0);
        while let Some(offset) = start {
            let page = self.search(jql, offset, MAX_RESULTS, "id").await?;
            start = page.next_start();
            ids.extend(page.issues.into_iter().map(|i| i.id));
        }
        Ok(ids)
    }

    pub async fn can_view(&self, issue_id: &str) -> Result<bool> {
        let path = format!("rest/api/2/issue/{}", issue_id);
        let request = self.client.get(&path).query(&[("fields", "id")]);
        let response = self.client.send(request, &path).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.client.status_error(status, &path)),
        }
    }
}

pub struct JiraListing {
    api: JiraApi,
    query: JqlQuery,
}

impl JiraListing {
    pub fn new(api: JiraApi, query: JqlQuery) -> Self {
        Self { api, query }
    }
}

#[async_trait]
impl SourceListing for JiraListing {
    type Scope = JqlQuery;

    fn source(&self) -> DataSource {
        DataSource::Jira
    }

    async fn list_scopes(&self) -> Result<Vec<JqlQuery>> {
        Ok(vec![self.query.clone()])
    }

    async fn fetch_page(&self, query: &JqlQuery, cursor: Option<&str>, page_size: usize) -> Result<Page> {
        // A cursor that does not parse restarts the query.
        let start_at = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let page = self
            .api
            .search(&query.jql, start_at, page_size.min(MAX_RESULTS), SEARCH_FIELDS)
            .await?;
        let next_cursor = page.next_start().map(|n| n.to_string());
        debug!(start_at, issues = page.issues.len(), total = page.total, "fetched jira issues");

        let documents = page
            .issues
            .into_iter()
            .map(|issue| {
                let mut content = issue.fields.summary;
                if let Some(description) = issue.fields.description.filter(|d| !d.is_empty()) {
                    content.push_str("\n\n");
                    content.push_str(&description);
                }
                let mut metadata = Metadata::new();
                metadata.insert(keys::DATA_SOURCE.into(), DataSource::Jira.as_str().into());
                metadata.insert(keys::JIRA_ISSUE_ID.into(), issue.id.into());
                metadata.insert(keys::JIRA_ISSUE_KEY.into(), issue.key.into());
                Document::new(content, metadata)
            })
            .collect();

        Ok(Page {
            documents,
            next_cursor,
        })
    }
}

/// Derives `jira_project_key` from `jira_issue_key`.
#[derive(Debug, Default)]
pub struct JiraProjectEnricher;

#[async_trait]
impl MetadataEnricher for JiraProjectEnricher {
    fn name(&self) -> &str {
        "jira_project"
    }

    fn applies_to(&self, source: DataSource) -> bool {
        source == DataSource::Jira
    }

    async fn extract(&self, metadata: &Metadata, _content: &[u8]) -> Result<Metadata> {
        let issue_key = metadata_text(metadata, keys::JIRA_ISSUE_KEY)?;
        let mut out = Metadata::new();
        if let Some(project) = project_key(issue_key) {
            out.insert(keys::JIRA_PROJECT_KEY.into(), project.into());
        }
        Ok(out)
    }
}

/// Issue visibility for one Jira user, asked with their credential.
///
/// Candidates for [`get_filter`](multipass_core::AccessProcessor::get_filter)
/// come from the admin's view of the same JQL.
pub struct JiraAccess {
    user_api: JiraApi,
    admin_api: JiraApi,
    user_email: String,
    jql: String,
}

impl JiraAccess {
    pub fn new(user_api: JiraApi, admin_api: JiraApi, user_email: impl Into<String>, jql: impl Into<String>) -> Self {
        Self {
            user_api,
            admin_api,
            user_email: user_email.into(),
            jql: jql.into(),
        }
    }
}

#[async_trait]
impl AccessCheck for JiraAccess {
    fn source(&self) -> DataSource {
        DataSource::Jira
    }

    fn filter_key(&self) -> &str {
        keys::JIRA_ISSUE_ID
    }

    fn principal(&self) -> &str {
        &self.user_email
    }

    fn shape(&self) -> CheckShape {
        CheckShape::Direct
    }

    fn object_id(&self, metadata: &Metadata) -> Result<ObjectId> {
        metadata_text(metadata, keys::JIRA_ISSUE_ID).map(ObjectId::from)
    }

    async fn check(&self, object: &ObjectId) -> Result<bool> {
        self.user_api.can_view(&object.to_string()).await
    }

    async fn list_objects(&self) -> Result<Vec<ObjectId>> {
        Ok(self
            .admin_api
            .issue_ids(&self.jql)
            .await?
            .into_iter()
            .map(ObjectId::from)
            .collect())
    }
}

fn api(config: &JiraSourceConfig, http: &HttpConfig, email: &str, token_env: &str) -> anyhow::Result<JiraApi> {
    let auth = Auth::Basic {
        user: email.to_string(),
        secret: env_token(token_env)?,
    };
    let client = ApiClient::new(DataSource::Jira, &config.base_url, auth, http)?;
    Ok(JiraApi::new(client))
}

pub fn reader(config: &JiraSourceConfig, http: &HttpConfig) -> anyhow::Result<NestedReader<JiraListing>> {
    let query = JqlQuery {
        jql: config.jql.clone(),
    };
    let admin = api(config, http, &config.admin_email, &config.admin_token_env)?;
    Ok(NestedReader::pinned(JiraListing::new(admin, query.clone()), query))
}

pub fn access(config: &JiraSourceConfig, http: &HttpConfig) -> anyhow::Result<JiraAccess> {
    Ok(JiraAccess::new(
        api(config, http, &config.user_email, &config.user_token_env)?,
        api(config, http, &config.admin_email, &config.admin_token_env)?,
        config.user_email.as_str(),
        config.jql.as_str(),
    ))
}
