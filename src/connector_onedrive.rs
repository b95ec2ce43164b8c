//! OneDrive connector (Microsoft Graph).
//!
//! Reads a drive through the `root/delta` feed, following
//! `@odata.nextLink`. Access is checked per item with the admin token:
//! `GET /users/{user}/drive/items/{item}/permissions` is 200 when the user
//! can reach the item and 404 when they cannot. The user id is resolved
//! once from the configured email.

use async_trait::async_trait;
use multipass_core::models::metadata_text;
use multipass_core::reader::{NestedReader, Page, Scope, SourceListing};
use multipass_core::{
    keys, AccessCheck, CheckShape, DataSource, Document, Metadata, MultipassError, ObjectId, Result,
};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::config::{env_token, HttpConfig, OneDriveSourceConfig};
use crate::http::{ApiClient, Auth};
use crate::path_filter::PathFilter;

/// A drive, addressed relative to the Graph base URL (`me/drive`,
/// `users/{id}/drive`).
#[derive(Debug, Clone)]
pub struct Drive {
    pub path: String,
}

impl Scope for Drive {
    fn scope_id(&self) -> String {
        self.path.clone()
    }
}

#[derive(Debug, Deserialize)]
struct ParentReference {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    id: String,
    #[serde(default)]
    name: String,
    file: Option<serde_json::Value>,
    deleted: Option<serde_json::Value>,
    #[serde(rename = "parentReference")]
    parent: Option<ParentReference>,
}

impl DriveItem {
    fn is_file(&self) -> bool {
        self.file.is_some() && self.deleted.is_none()
    }

    /// Path inside the drive, without the `/drive/root:` prefix.
    fn path(&self) -> String {
        let parent = self
            .parent
            .as_ref()
            .map(|p| p.path.as_str())
            .unwrap_or_default();
        let parent = parent.split_once("root:").map_or(parent, |(_, rest)| rest);
        format!("{}/{}", parent.trim_end_matches('/'), self.name)
    }
}

#[derive(Debug, Deserialize)]
struct DeltaResponse {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphUser {
    id: String,
}

#[derive(Debug, Clone)]
pub struct OneDriveApi {
    client: ApiClient,
}

impl OneDriveApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    async fn delta(&self, drive: &Drive, cursor: Option<&str>, top: usize) -> Result<DeltaResponse> {
        let url = match cursor {
            Some(next) => next.to_string(),
            None => self.client.url(&format!("{}/root/delta?$top={}", drive.path, top)),
        };
        self.client.json(self.client.get(&url), "root/delta").await
    }

    async fn content(&self, drive: &Drive, item_id: &str) -> Result<Vec<u8>> {
        let path = format!("{}/items/{}/content", drive.path, item_id);
        self.client.bytes(self.client.get(&path), &path).await
    }

    /// Graph user id for an email or UPN; `None` when no such user exists.
    pub async fn user_id(&self, email: &str) -> Result<Option<String>> {
        let url = self.client.url_with_segments(&["users", email])?;
        let response = self.client.send(self.client.get(&url), "users").await?;
        match response.status() {
            StatusCode::OK => {
                let user: GraphUser = self.client.decode(response, "users").await?;
                Ok(Some(user.id))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(self.client.status_error(status, "users")),
        }
    }

    pub async fn user_can_reach(&self, user_id: &str, item_id: &str) -> Result<bool> {
        let path = format!("users/{}/drive/items/{}/permissions", user_id, item_id);
        let response = self.client.send(self.client.get(&path), &path).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.client.status_error(status, &path)),
        }
    }

    /// Ids of every file in the drive.
    async fn file_ids(&self, drive: &Drive) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.delta(drive, cursor.as_deref(), 200).await?;
            ids.extend(page.value.into_iter().filter(DriveItem::is_file).map(|i| i.id));
            cursor = page.next_link;
            if cursor.is_none() {
                break;
            }
        }
        Ok(ids)
    }
}

pub struct OneDriveListing {
    api: OneDriveApi,
    drive: Drive,
    paths: PathFilter,
}

impl OneDriveListing {
    pub fn new(api: OneDriveApi, drive: Drive, paths: PathFilter) -> Self {
        Self { api, drive, paths }
    }
}

#[async_trait]
impl SourceListing for OneDriveListing {
    type Scope = Drive;

    fn source(&self) -> DataSource {
        DataSource::OneDrive
    }

    async fn list_scopes(&self) -> Result<Vec<Drive>> {
        Ok(vec![self.drive.clone()])
    }

    async fn fetch_page(&self, drive: &Drive, cursor: Option<&str>, page_size: usize) -> Result<Page> {
        let delta = self.api.delta(drive, cursor, page_size).await?;

        let mut documents = Vec::new();
        for item in delta.value.iter().filter(|i| i.is_file()) {
            let path = item.path();
            if !self.paths.is_match(&path) {
                continue;
            }
            let content = self.api.content(drive, &item.id).await?;

            let mut metadata = Metadata::new();
            metadata.insert(keys::DATA_SOURCE.into(), DataSource::OneDrive.as_str().into());
            metadata.insert(keys::ONEDRIVE_ID.into(), item.id.as_str().into());
            metadata.insert(keys::FILE_PATH.into(), path.into());
            metadata.insert(keys::FILE_NAME.into(), item.name.as_str().into());
            documents.push(Document::new(content, metadata));
        }

        Ok(Page {
            documents,
            next_cursor: delta.next_link,
        })
    }
}

/// Per-item reachability for one OneDrive user.
pub struct OneDriveAccess {
    api: OneDriveApi,
    drive: Drive,
    user_email: String,
    user_id: OnceCell<Option<String>>,
}

impl OneDriveAccess {
    pub fn new(api: OneDriveApi, drive: Drive, user_email: impl Into<String>) -> Self {
        Self {
            api,
            drive,
            user_email: user_email.into(),
            user_id: OnceCell::new(),
        }
    }

    async fn user_id(&self) -> Result<Option<&str>> {
        let id = self
            .user_id
            .get_or_try_init(|| async {
                let id = self.api.user_id(&self.user_email).await?;
                if id.is_none() {
                    warn!(email = %self.user_email, "onedrive user not found; denying all items");
                }
                Ok::<_, MultipassError>(id)
            })
            .await?;
        Ok(id.as_deref())
    }
}

#[async_trait]
impl AccessCheck for OneDriveAccess {
    fn source(&self) -> DataSource {
        DataSource::OneDrive
    }

    fn filter_key(&self) -> &str {
        keys::ONEDRIVE_ID
    }

    fn principal(&self) -> &str {
        &self.user_email
    }

    fn shape(&self) -> CheckShape {
        CheckShape::Direct
    }

    fn object_id(&self, metadata: &Metadata) -> Result<ObjectId> {
        metadata_text(metadata, keys::ONEDRIVE_ID).map(ObjectId::from)
    }

    async fn check(&self, object: &ObjectId) -> Result<bool> {
        let Some(user_id) = self.user_id().await? else {
            return Ok(false);
        };
        self.api.user_can_reach(user_id, &object.to_string()).await
    }

    async fn list_objects(&self) -> Result<Vec<ObjectId>> {
        Ok(self
            .api
            .file_ids(&self.drive)
            .await?
            .into_iter()
            .map(ObjectId::from)
            .collect())
    }
}

fn admin_api(config: &OneDriveSourceConfig, http: &HttpConfig) -> anyhow::Result<OneDriveApi> {
    let token = env_token(&config.admin_token_env)?;
    let client = ApiClient::new(DataSource::OneDrive, &config.base_url, Auth::Bearer(token), http)?;
    Ok(OneDriveApi::new(client))
}

fn drive(config: &OneDriveSourceConfig) -> Drive {
    let path = match &config.drive_owner {
        Some(owner) => format!("users/{}/drive", owner),
        None => "me/drive".to_string(),
    };
    Drive { path }
}

pub fn reader(
    config: &OneDriveSourceConfig,
    http: &HttpConfig,
) -> anyhow::Result<NestedReader<OneDriveListing>> {
    let paths = PathFilter::new(&config.include_globs, &config.exclude_globs)?;
    let drive = drive(config);
    let listing = OneDriveListing::new(admin_api(config, http)?, drive.clone(), paths);
    Ok(NestedReader::pinned(listing, drive))
}

pub fn access(config: &OneDriveSourceConfig, http: &HttpConfig) -> anyhow::Result<OneDriveAccess> {
    Ok(OneDriveAccess::new(
        admin_api(config, http)?,
        drive(config),
        config.user_email.as_str(),
    ))
}
