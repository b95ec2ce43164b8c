//! Dropbox connector.
//!
//! Reads one folder (recursively by default) with `files/list_folder` and
//! its `continue` cursor, skipping folders and deleted entries. Each file is
//! attributed to the namespace that owns it: its parent shared folder, or
//! the reading account's home namespace. [`DropboxFolderEnricher`] writes
//! that namespace under `dropbox_folder_id`, and access is checked per
//! namespace:
//!
//! - shared folders whose member list contains the user's email
//! - the home namespace, when the user is the account that owns the token

use std::collections::BTreeSet;

use async_trait::async_trait;
use multipass_core::enrich::MetadataEnricher;
use multipass_core::models::metadata_text;
use multipass_core::reader::{NestedReader, Page, Scope, SourceListing};
use multipass_core::{
    keys, AccessCheck, CheckShape, DataSource, Document, Metadata, MetadataValue, ObjectId, Result,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::{env_token, DropboxSourceConfig, HttpConfig};
use crate::http::{ApiClient, Auth};
use crate::path_filter::PathFilter;

#[derive(Debug, Clone)]
pub struct DropboxFolder {
    pub path: String,
    pub recursive: bool,
}

impl Scope for DropboxFolder {
    fn scope_id(&self) -> String {
        self.path.clone()
    }
}

#[derive(Debug, Deserialize)]
struct SharingInfo {
    parent_shared_folder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(rename = ".tag")]
    tag: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    path_lower: Option<String>,
    sharing_info: Option<SharingInfo>,
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    #[serde(default)]
    entries: Vec<Entry>,
    cursor: String,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct SharedFolder {
    shared_folder_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct SharedFoldersResponse {
    #[serde(default)]
    entries: Vec<SharedFolder>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MemberUser {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Deserialize)]
struct UserMembership {
    user: MemberUser,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    users: Vec<UserMembership>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RootInfo {
    home_namespace_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DropboxAccount {
    pub email: String,
    root_info: RootInfo,
}

impl DropboxAccount {
    pub fn home_namespace_id(&self) -> &str {
        &self.root_info.home_namespace_id
    }
}

#[derive(Debug, Clone)]
pub struct DropboxApi {
    client: ApiClient,
    content_url: String,
}

impl DropboxApi {
    pub fn new(client: ApiClient, content_url: impl Into<String>) -> Self {
        Self {
            client,
            content_url: content_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn list_folder(&self, folder: &DropboxFolder, cursor: Option<&str>, limit: usize) -> Result<ListFolderResponse> {
        let request = match cursor {
            Some(cursor) => self
                .client
                .post("files/list_folder/continue")
                .json(&json!({ "cursor": cursor })),
            None => self.client.post("files/list_folder").json(&json!({
                "path": folder.path,
                "recursive": folder.recursive,
                "limit": limit.clamp(1, 2000),
            })),
        };
        self.client.json(request, "files/list_folder").await
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let arg = json!({ "path": path }).to_string();
        let request = self
            .client
            .post(&format!("{}/files/download", self.content_url))
            .header("Dropbox-API-Arg", arg);
        self.client.bytes(request, path).await
    }

    pub async fn current_account(&self) -> Result<DropboxAccount> {
        self.client
            .json(self.client.post("users/get_current_account"), "users/get_current_account")
            .await
    }

    async fn shared_folders(&self) -> Result<Vec<SharedFolder>> {
        let mut folders = Vec::new();
        let mut page: SharedFoldersResponse = self
            .client
            .json(
                self.client.post("sharing/list_folders").json(&json!({ "limit": 1000 })),
                "sharing/list_folders",
            )
            .await?;
        loop {
            folders.append(&mut page.entries);
            let Some(cursor) = page.cursor.take() else {
                break;
            };
            page = self
                .client
                .json(
                    self.client
                        .post("sharing/list_folders/continue")
                        .json(&json!({ "cursor": cursor })),
                    "sharing/list_folders/continue",
                )
                .await?;
        }
        Ok(folders)
    }

    async fn member_emails(&self, shared_folder_id: &str) -> Result<Vec<String>> {
        let mut emails = Vec::new();
        let mut page: MembersResponse = self
            .client
            .json(
                self.client
                    .post("sharing/list_folder_members")
                    .json(&json!({ "shared_folder_id": shared_folder_id, "limit": 1000 })),
                shared_folder_id,
            )
            .await?;
        loop {
            emails.extend(page.users.drain(..).map(|m| m.user.email));
            let Some(cursor) = page.cursor.take() else {
                break;
            };
            page = self
                .client
                .json(
                    self.client
                        .post("sharing/list_folder_members/continue")
                        .json(&json!({ "cursor": cursor })),
                    shared_folder_id,
                )
                .await?;
        }
        Ok(emails)
    }
}

pub struct DropboxListing {
    api: DropboxApi,
    folder: DropboxFolder,
    paths: PathFilter,
}

impl DropboxListing {
    pub fn new(api: DropboxApi, folder: DropboxFolder, paths: PathFilter) -> Self {
        Self { api, folder, paths }
    }
}

#[async_trait]
impl SourceListing for DropboxListing {
    type Scope = DropboxFolder;

    fn source(&self) -> DataSource {
        DataSource::Dropbox
    }

    async fn list_scopes(&self) -> Result<Vec<DropboxFolder>> {
        Ok(vec![self.folder.clone()])
    }

    async fn fetch_page(
        &self,
        folder: &DropboxFolder,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page> {
        let listing = self.api.list_folder(folder, cursor, page_size).await?;

        let mut documents = Vec::new();
        for entry in listing.entries {
            if entry.tag != "file" {
                continue;
            }
            let Some(path) = entry.path_lower.filter(|p| !p.is_empty()) else {
                continue;
            };
            if !self.paths.is_match(&path) {
                continue;
            }
            let content = self.api.download(&path).await?;

            let mut metadata = Metadata::new();
            metadata.insert(keys::DATA_SOURCE.into(), DataSource::Dropbox.as_str().into());
            metadata.insert(keys::DROPBOX_ID.into(), entry.id.into());
            metadata.insert(keys::FILE_PATH.into(), path.into());
            metadata.insert(keys::FILE_NAME.into(), entry.name.into());
            if let Some(shared) = entry.sharing_info.and_then(|s| s.parent_shared_folder_id) {
                metadata.insert(keys::DROPBOX_SHARED_FOLDER_ID.into(), shared.into());
            }
            documents.push(Document::new(content, metadata));
        }

        Ok(Page {
            documents,
            next_cursor: listing.has_more.then_some(listing.cursor),
        })
    }
}

/// Writes the owning namespace of each Dropbox file under
/// `dropbox_folder_id`.
pub struct DropboxFolderEnricher {
    api: DropboxApi,
    home: OnceCell<String>,
}

impl DropboxFolderEnricher {
    pub fn new(api: DropboxApi) -> Self {
        Self {
            api,
            home: OnceCell::new(),
        }
    }
}

#[async_trait]
impl MetadataEnricher for DropboxFolderEnricher {
    fn name(&self) -> &str {
        "dropbox_folder"
    }

    fn applies_to(&self, source: DataSource) -> bool {
        source == DataSource::Dropbox
    }

    async fn extract(&self, metadata: &Metadata, _content: &[u8]) -> Result<Metadata> {
        let folder = match metadata.get(keys::DROPBOX_SHARED_FOLDER_ID).and_then(MetadataValue::as_text) {
            Some(shared) if !shared.is_empty() => shared.to_string(),
            _ => self
                .home
                .get_or_try_init(|| async {
                    let account = self.api.current_account().await?;
                    Ok::<_, multipass_core::MultipassError>(account.home_namespace_id().to_string())
                })
                .await?
                .clone(),
        };
        let mut out = Metadata::new();
        out.insert(keys::DROPBOX_FOLDER_ID.into(), folder.into());
        Ok(out)
    }
}

/// Namespaces (shared folders and the home namespace) one user may read.
pub struct DropboxAccess {
    api: DropboxApi,
    user_email: String,
}

impl DropboxAccess {
    pub fn new(api: DropboxApi, user_email: impl Into<String>) -> Self {
        Self {
            api,
            user_email: user_email.into(),
        }
    }
}

#[async_trait]
impl AccessCheck for DropboxAccess {
    fn source(&self) -> DataSource {
        DataSource::Dropbox
    }

    fn filter_key(&self) -> &str {
        keys::DROPBOX_FOLDER_ID
    }

    fn principal(&self) -> &str {
        &self.user_email
    }

    fn shape(&self) -> CheckShape {
        CheckShape::Enumerate
    }

    fn object_id(&self, metadata: &Metadata) -> Result<ObjectId> {
        metadata_text(metadata, keys::DROPBOX_FOLDER_ID).map(ObjectId::from)
    }

    async fn check(&self, object: &ObjectId) -> Result<bool> {
        Ok(self.list_objects().await?.contains(object))
    }

    async fn list_objects(&self) -> Result<Vec<ObjectId>> {
        let mut allowed = BTreeSet::new();

        let account = self.api.current_account().await?;
        if account.email.eq_ignore_ascii_case(&self.user_email) {
            allowed.insert(account.home_namespace_id().to_string());
        }

        for folder in self.api.shared_folders().await? {
            let members = self.api.member_emails(&folder.shared_folder_id).await?;
            if members.iter().any(|m| m.eq_ignore_ascii_case(&self.user_email)) {
                debug!(folder = %folder.name, "dropbox shared folder granted");
                allowed.insert(folder.shared_folder_id);
            }
        }

        Ok(allowed.into_iter().map(ObjectId::from).collect())
    }
}

fn admin_api(config: &DropboxSourceConfig, http: &HttpConfig) -> anyhow::Result<DropboxApi> {
    let token = env_token(&config.admin_token_env)?;
    let client = ApiClient::new(DataSource::Dropbox, &config.base_url, Auth::Bearer(token), http)?;
    Ok(DropboxApi::new(client, config.content_url.as_str()))
}

pub fn reader(
    config: &DropboxSourceConfig,
    http: &HttpConfig,
) -> anyhow::Result<NestedReader<DropboxListing>> {
    let folder = DropboxFolder {
        path: config.folder_path.clone(),
        recursive: config.recursive,
    };
    let paths = PathFilter::new(&config.include_globs, &config.exclude_globs)?;
    let listing = DropboxListing::new(admin_api(config, http)?, folder.clone(), paths);
    Ok(NestedReader::pinned(listing, folder))
}

pub fn enricher(config: &DropboxSourceConfig, http: &HttpConfig) -> anyhow::Result<DropboxFolderEnricher> {
    Ok(DropboxFolderEnricher::new(admin_api(config, http)?))
}

pub fn access(config: &DropboxSourceConfig, http: &HttpConfig) -> anyhow::Result<DropboxAccess> {
    Ok(DropboxAccess::new(admin_api(config, http)?, config.user_email.as_str()))
}
