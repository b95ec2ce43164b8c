//! Google Drive connector (Drive API v3).
//!
//! Reads the direct children of one folder with `pageToken` pagination and
//! downloads binary files with `alt=media`. Folders and native Google
//! documents (which only export, never download) are skipped.
//!
//! Access is checked per file against its permission list, read with the
//! admin token. A permission grants the user when it is:
//!
//! - a `user` or `group` entry for the user's email
//! - a `domain` entry for the user's email domain
//! - an `anyone` entry

use async_trait::async_trait;
use multipass_core::enrich::MetadataEnricher;
use multipass_core::models::metadata_text;
use multipass_core::reader::{NestedReader, Page, Scope, SourceListing};
use multipass_core::{
    keys, AccessCheck, CheckShape, DataSource, Document, Metadata, MetadataValue, ObjectId, Result,
};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::config::{env_token, GDriveSourceConfig, HttpConfig};
use crate::http::{ApiClient, Auth};
use crate::path_filter::PathFilter;

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const NATIVE_MIME_PREFIX: &str = "application/vnd.google-apps.";

#[derive(Debug, Clone)]
pub struct DriveFolder {
    pub id: String,
}

impl Scope for DriveFolder {
    fn scope_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "mimeType", default)]
    mime_type: String,
}

impl DriveFile {
    fn is_downloadable(&self) -> bool {
        !self.mime_type.starts_with(NATIVE_MIME_PREFIX)
    }
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Owner {
    #[serde(rename = "emailAddress", default)]
    email_address: String,
}

#[derive(Debug, Deserialize)]
struct FileParents {
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    owners: Vec<Owner>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Permission {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "emailAddress")]
    pub email_address: Option<String>,
    pub domain: Option<String>,
}

impl Permission {
    /// Whether this permission lets `email` read the file.
    pub fn grants(&self, email: &str) -> bool {
        let user_domain = email.rsplit_once('@').map(|(_, domain)| domain);
        match self.kind.as_str() {
            "anyone" => true,
            "user" | "group" => self
                .email_address
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(email)),
            "domain" => match (self.domain.as_deref(), user_domain) {
                (Some(granted), Some(user)) => granted.eq_ignore_ascii_case(user),
                _ => false,
            },
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PermissionList {
    #[serde(default)]
    permissions: Vec<Permission>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GDriveApi {
    client: ApiClient,
}

impl GDriveApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    async fn children(&self, folder: &DriveFolder, page_token: Option<&str>, page_size: usize) -> Result<FileList> {
        let mut params = vec![
            ("q", format!("'{}' in parents and trashed = false", folder.id)),
            ("pageSize", page_size.clamp(1, 1000).to_string()),
            ("fields", "nextPageToken,files(id,name,mimeType)".to_string()),
        ];
        params.extend(page_token.map(|t| ("pageToken", t.to_string())));
        self.client.json(self.client.get("files").query(&params), "files").await
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let path = format!("files/{}", file_id);
        self.client
            .bytes(self.client.get(&path).query(&[("alt", "media")]), &path)
            .await
    }

    async fn parents(&self, file_id: &str) -> Result<FileParents> {
        let path = format!("files/{}", file_id);
        let request = self
            .client
            .get(&path)
            .query(&[("fields", "parents,owners(emailAddress)")]);
        self.client.json(request, &path).await
    }

    /// Every permission on a file; `None` when the file no longer exists.
    pub async fn permissions(&self, file_id: &str) -> Result<Option<Vec<Permission>>> {
        let path = format!("files/{}/permissions", file_id);
        let mut permissions = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![(
                "fields",
                "nextPageToken,permissions(type,emailAddress,domain)".to_string(),
            )];
            params.extend(page_token.take().map(|t| ("pageToken", t)));
            let response = self
                .client
                .send(self.client.get(&path).query(&params), &path)
                .await?;
            match response.status() {
                StatusCode::NOT_FOUND => return Ok(None),
                status if !status.is_success() => return Err(self.client.status_error(status, &path)),
                _ => {}
            }
            let page: PermissionList = self.client.decode(response, &path).await?;
            permissions.extend(page.permissions);
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(Some(permissions))
    }

    async fn file_ids(&self, folder: &DriveFolder) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.children(folder, page_token.as_deref(), 1000).await?;
            ids.extend(
                page.files
                    .into_iter()
                    .filter(|f| f.mime_type != FOLDER_MIME)
                    .map(|f| f.id),
            );
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(ids)
    }
}

pub struct GDriveListing {
    api: GDriveApi,
    folder: DriveFolder,
    paths: PathFilter,
}

impl GDriveListing {
    pub fn new(api: GDriveApi, folder: DriveFolder, paths: PathFilter) -> Self {
        Self { api, folder, paths }
    }
}

#[async_trait]
impl SourceListing for GDriveListing {
    type Scope = DriveFolder;

    fn source(&self) -> DataSource {
        DataSource::GDrive
    }

    async fn list_scopes(&self) -> Result<Vec<DriveFolder>> {
        Ok(vec![self.folder.clone()])
    }

    async fn fetch_page(&self, folder: &DriveFolder, cursor: Option<&str>, page_size: usize) -> Result<Page> {
        let listing = self.api.children(folder, cursor, page_size).await?;

        let mut documents = Vec::new();
        for file in listing.files {
            if !file.is_downloadable() {
                debug!(file = %file.name, mime = %file.mime_type, "skipping non-downloadable drive entry");
                continue;
            }
            if !self.paths.is_match(&file.name) {
                continue;
            }
            let content = self.api.download(&file.id).await?;

            let mut metadata = Metadata::new();
            metadata.insert(keys::DATA_SOURCE.into(), DataSource::GDrive.as_str().into());
            metadata.insert(keys::GDRIVE_FILE_ID.into(), file.id.into());
            metadata.insert(keys::FILE_NAME.into(), file.name.into());
            documents.push(Document::new(content, metadata));
        }

        Ok(Page {
            documents,
            next_cursor: listing.next_page_token,
        })
    }
}

/// Attaches parent folder ids and owner emails to Drive documents.
pub struct GDriveEnricher {
    api: GDriveApi,
}

impl GDriveEnricher {
    pub fn new(api: GDriveApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl MetadataEnricher for GDriveEnricher {
    fn name(&self) -> &str {
        "gdrive"
    }

    fn applies_to(&self, source: DataSource) -> bool {
        source == DataSource::GDrive
    }

    async fn extract(&self, metadata: &Metadata, _content: &[u8]) -> Result<Metadata> {
        let file_id = metadata_text(metadata, keys::GDRIVE_FILE_ID)?;
        let parents = self.api.parents(file_id).await?;
        let mut out = Metadata::new();
        out.insert(keys::GDRIVE_PARENT_IDS.into(), MetadataValue::List(parents.parents));
        out.insert(
            keys::GDRIVE_OWNERS.into(),
            MetadataValue::List(parents.owners.into_iter().map(|o| o.email_address).collect()),
        );
        Ok(out)
    }
}

/// Per-file permission check for one Drive user.
pub struct GDriveAccess {
    api: GDriveApi,
    folder: DriveFolder,
    user_email: String,
}

impl GDriveAccess {
    pub fn new(api: GDriveApi, folder: DriveFolder, user_email: impl Into<String>) -> Self {
        Self {
            api,
            folder,
            user_email: user_email.into(),
        }
    }
}

#[async_trait]
impl AccessCheck for GDriveAccess {
    fn source(&self) -> DataSource {
        DataSource::GDrive
    }

    fn filter_key(&self) -> &str {
        keys::GDRIVE_FILE_ID
    }

    fn principal(&self) -> &str {
        &self.user_email
    }

    fn shape(&self) -> CheckShape {
        CheckShape::Direct
    }

    fn object_id(&self, metadata: &Metadata) -> Result<ObjectId> {
        metadata_text(metadata, keys::GDRIVE_FILE_ID).map(ObjectId::from)
    }

    async fn check(&self, object: &ObjectId) -> Result<bool> {
        let Some(permissions) = self.api.permissions(&object.to_string()).await? else {
            return Ok(false);
        };
        Ok(permissions.iter().any(|p| p.grants(&self.user_email)))
    }

    async fn list_objects(&self) -> Result<Vec<ObjectId>> {
        Ok(self
            .api
            .file_ids(&self.folder)
            .await?
            .into_iter()
            .map(ObjectId::from)
            .collect())
    }
}

fn admin_api(config: &GDriveSourceConfig, http: &HttpConfig) -> anyhow::Result<GDriveApi> {
    let token = env_token(&config.admin_token_env)?;
    let client = ApiClient::new(DataSource::GDrive, &config.base_url, Auth::Bearer(token), http)?;
    Ok(GDriveApi::new(client))
}

fn folder(config: &GDriveSourceConfig) -> DriveFolder {
    DriveFolder {
        id: config.folder_id.clone(),
    }
}

pub fn reader(config: &GDriveSourceConfig, http: &HttpConfig) -> anyhow::Result<NestedReader<GDriveListing>> {
    let paths = PathFilter::new(&config.include_globs, &config.exclude_globs)?;
    let listing = GDriveListing::new(admin_api(config, http)?, folder(config), paths);
    Ok(NestedReader::pinned(listing, folder(config)))
}

pub fn enricher(config: &GDriveSourceConfig, http: &HttpConfig) -> anyhow::Result<GDriveEnricher> {
    Ok(GDriveEnricher::new(admin_api(config, http)?))
}

pub fn access(config: &GDriveSourceConfig, http: &HttpConfig) -> anyhow::Result<GDriveAccess> {
    Ok(GDriveAccess::new(
        admin_api(config, http)?,
        folder(config),
        config.user_email.as_str(),
    ))
}
