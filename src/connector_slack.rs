//! Slack connector.
//!
//! Channels are scopes and messages are documents (`channel_join` notices
//! are skipped). Access is by channel membership, enumerated once with
//! `users.conversations`, either for a user looked up by email with the
//! admin token or for the owner of a user token.
//!
//! Slack answers most failures with HTTP 200 and `{"ok": false, "error": ..}`;
//! auth-type errors map to `InsufficientPermissions`, the rest to
//! `SourceUnavailable`.

use async_trait::async_trait;
use multipass_core::models::metadata_text;
use multipass_core::reader::{NestedReader, Page, Scope, SourceListing};
use multipass_core::{
    keys, AccessCheck, CheckShape, DataSource, Document, Metadata, MultipassError, ObjectId, Result,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{env_token, HttpConfig, SlackSourceConfig};
use crate::http::{ApiClient, Auth};

const CHANNEL_TYPES: &str = "public_channel,private_channel";

#[derive(Debug, Clone, Deserialize)]
pub struct SlackChannel {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl Scope for SlackChannel {
    fn scope_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

impl ResponseMetadata {
    fn cursor(self) -> Option<String> {
        Some(self.next_cursor).filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    #[serde(default)]
    channels: Vec<SlackChannel>,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    user: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    ts: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    user: SlackUser,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    id: String,
}

fn is_auth_error(error: &str) -> bool {
    matches!(
        error,
        "not_authed" | "invalid_auth" | "account_inactive" | "token_revoked" | "missing_scope" | "no_permission"
    )
}

#[derive(Debug, Clone)]
pub struct SlackApi {
    client: ApiClient,
}

impl SlackApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: &[(&str, String)]) -> Result<T> {
        let request = self.client.get(method).query(params);
        let value: Value = self.client.json(request, method).await?;
        if value.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error")
                .to_string();
            return Err(if is_auth_error(&error) {
                MultipassError::insufficient(DataSource::Slack, method, error)
            } else {
                MultipassError::unavailable(DataSource::Slack, method, error)
            });
        }
        serde_json::from_value(value).map_err(|e| {
            MultipassError::unavailable(DataSource::Slack, method, format!("invalid response body: {}", e))
        })
    }

    /// Every channel (public and private) the token can see.
    pub async fn list_channels(&self) -> Result<Vec<SlackChannel>> {
        let mut channels = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut params = vec![("types", CHANNEL_TYPES.to_string()), ("limit", "200".to_string())];
            params.extend(cursor.take().map(|c| ("cursor", c)));
            let page: ChannelsResponse = self.call("conversations.list", &params).await?;
            channels.extend(page.channels);
            cursor = page.response_metadata.cursor();
            if cursor.is_none() {
                break;
            }
        }
        debug!(channels = channels.len(), "listed slack channels");
        Ok(channels)
    }

    /// Channels `user` belongs to; `None` means the token owner.
    pub async fn member_channels(&self, user: Option<&str>) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut params = vec![("types", CHANNEL_TYPES.to_string()), ("limit", "200".to_string())];
            params.extend(user.map(|u| ("user", u.to_string())));
            params.extend(cursor.take().map(|c| ("cursor", c)));
            let page: ChannelsResponse = self.call("users.conversations", &params).await?;
            ids.extend(page.channels.into_iter().map(|c| c.id));
            cursor = page.response_metadata.cursor();
            if cursor.is_none() {
                break;
            }
        }
        Ok(ids)
    }

    /// The user id for `email`, or `None` when no such user exists.
    pub async fn lookup_user(&self, email: &str) -> Result<Option<String>> {
        match self
            .call::<LookupResponse>("users.lookupByEmail", &[("email", email.to_string())])
            .await
        {
            Ok(found) => Ok(Some(found.user.id)),
            Err(MultipassError::SourceUnavailable { reason, .. }) if reason == "users_not_found" => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn fingerprint(&self) -> String {
        self.client.fingerprint()
    }
}

pub struct SlackListing {
    api: SlackApi,
}

impl SlackListing {
    pub fn new(api: SlackApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl SourceListing for SlackListing {
    type Scope = SlackChannel;

    fn source(&self) -> DataSource {
        DataSource::Slack
    }

    async fn list_scopes(&self) -> Result<Vec<SlackChannel>> {
        self.api.list_channels().await
    }

    async fn fetch_page(
        &self,
        channel: &SlackChannel,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page> {
        let mut params = vec![("channel", channel.id.clone()), ("limit", page_size.to_string())];
        params.extend(cursor.map(|c| ("cursor", c.to_string())));
        let history: HistoryResponse = self.api.call("conversations.history", &params).await?;

        let documents = history
            .messages
            .into_iter()
            .filter(|m| m.subtype.as_deref() != Some("channel_join"))
            .map(|m| {
                let mut metadata = Metadata::new();
                metadata.insert(keys::DATA_SOURCE.into(), DataSource::Slack.as_str().into());
                metadata.insert(keys::SLACK_CHANNEL_ID.into(), channel.id.as_str().into());
                metadata.insert(keys::SLACK_CHANNEL_NAME.into(), channel.name.as_str().into());
                metadata.insert(keys::SLACK_TIMESTAMP.into(), m.ts.into());
                metadata.insert(keys::SLACK_USER.into(), m.user.into());
                Document::new(m.text, metadata)
            })
            .collect();

        let next_cursor = if history.has_more {
            history.response_metadata.cursor()
        } else {
            None
        };
        Ok(Page {
            documents,
            next_cursor,
        })
    }
}

#[derive(Debug, Clone)]
enum Member {
    Email(String),
    TokenOwner,
}

/// Channel membership of one Slack user.
pub struct SlackAccess {
    api: SlackApi,
    member: Member,
    principal: String,
}

impl SlackAccess {
    /// Look `email` up with an admin token.
    pub fn for_email(api: SlackApi, email: impl Into<String>) -> Self {
        let email = email.into();
        Self {
            api,
            principal: email.clone(),
            member: Member::Email(email),
        }
    }

    /// Memberships of whoever owns the token.
    pub fn for_token(api: SlackApi) -> Self {
        Self {
            principal: api.fingerprint(),
            api,
            member: Member::TokenOwner,
        }
    }
}

#[async_trait]
impl AccessCheck for SlackAccess {
    fn source(&self) -> DataSource {
        DataSource::Slack
    }

    fn filter_key(&self) -> &str {
        keys::SLACK_CHANNEL_ID
    }

    fn principal(&self) -> &str {
        &self.principal
    }

    fn shape(&self) -> CheckShape {
        CheckShape::Enumerate
    }

    fn object_id(&self, metadata: &Metadata) -> Result<ObjectId> {
        metadata_text(metadata, keys::SLACK_CHANNEL_ID).map(ObjectId::from)
    }

    async fn check(&self, object: &ObjectId) -> Result<bool> {
        Ok(self.list_objects().await?.contains(object))
    }

    async fn list_objects(&self) -> Result<Vec<ObjectId>> {
        let channels = match &self.member {
            Member::TokenOwner => self.api.member_channels(None).await?,
            Member::Email(email) => match self.api.lookup_user(email).await? {
                Some(user_id) => self.api.member_channels(Some(&user_id)).await?,
                None => {
                    warn!(email = %email, "slack user not found; denying all channels");
                    Vec::new()
                }
            },
        };
        Ok(channels.into_iter().map(ObjectId::from).collect())
    }
}

pub fn reader(
    config: &SlackSourceConfig,
    http: &HttpConfig,
) -> anyhow::Result<NestedReader<SlackListing>> {
    let token = env_token(&config.admin_token_env)?;
    let client = ApiClient::new(DataSource::Slack, &config.base_url, Auth::Bearer(token), http)?;
    Ok(NestedReader::new(SlackListing::new(SlackApi::new(client))))
}

pub fn access(config: &SlackSourceConfig, http: &HttpConfig) -> anyhow::Result<SlackAccess> {
    match (&config.user_email, &config.user_token_env) {
        (Some(email), _) => {
            let token = env_token(&config.admin_token_env)?;
            let client = ApiClient::new(DataSource::Slack, &config.base_url, Auth::Bearer(token), http)?;
            Ok(SlackAccess::for_email(SlackApi::new(client), email.as_str()))
        }
        (None, Some(user_env)) => {
            let token = env_token(user_env)?;
            let client = ApiClient::new(DataSource::Slack, &config.base_url, Auth::Bearer(token), http)?;
            Ok(SlackAccess::for_token(SlackApi::new(client)))
        }
        (None, None) => anyhow::bail!("sources.slack needs either user_email or user_token_env"),
    }
}
