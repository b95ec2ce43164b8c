//! Configuration parsing and validation.
//!
//! Multipass reads a single TOML file. Credentials are never stored in it:
//! each source names the environment variables that hold its tokens.
//!
//! ```toml
//! [http]
//! timeout_secs = 30
//!
//! [filter]
//! max_concurrency = 8
//! page_size = 100
//!
//! [sources.github]
//! admin_token_env = "GITHUB_ADMIN_TOKEN"
//! username = "octocat"
//! include_globs = ["**/*.md"]
//!
//! [sources.slack]
//! admin_token_env = "SLACK_ADMIN_TOKEN"
//! user_email = "alice@example.com"
//!
//! [oauth.dropbox]
//! auth_url = "https://www.dropbox.com/oauth2/authorize"
//! token_url = "https://api.dropbox.com/oauth2/token"
//! client_id = "abc123"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use multipass_core::DataSource;
use serde::Deserialize;

use crate::path_filter::PathFilter;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub oauth: BTreeMap<String, OAuthConfig>,
}

impl Config {
    /// A valid configuration with no sources.
    pub fn minimal() -> Self {
        Self::default()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Deadline for every external call, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("multipass/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            page_size: default_page_size(),
        }
    }
}

fn default_max_concurrency() -> usize {
    8
}
fn default_page_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    pub github: Option<GitHubSourceConfig>,
    pub gitlab: Option<GitLabSourceConfig>,
    pub slack: Option<SlackSourceConfig>,
    pub dropbox: Option<DropboxSourceConfig>,
    pub onedrive: Option<OneDriveSourceConfig>,
    pub confluence: Option<ConfluenceSourceConfig>,
    pub jira: Option<JiraSourceConfig>,
    pub gdrive: Option<GDriveSourceConfig>,
}

impl SourcesConfig {
    pub fn is_configured(&self, source: DataSource) -> bool {
        match source {
            DataSource::GitHub => self.github.is_some(),
            DataSource::GitLab => self.gitlab.is_some(),
            DataSource::Slack => self.slack.is_some(),
            DataSource::Dropbox => self.dropbox.is_some(),
            DataSource::OneDrive => self.onedrive.is_some(),
            DataSource::Confluence => self.confluence.is_some(),
            DataSource::Jira => self.jira.is_some(),
            DataSource::GDrive => self.gdrive.is_some(),
        }
    }

    /// Environment variables the configured source reads credentials from.
    pub fn credential_envs(&self, source: DataSource) -> Vec<&str> {
        let mut envs: Vec<&str> = Vec::new();
        match source {
            DataSource::GitHub => {
                if let Some(c) = &self.github {
                    envs.push(&c.admin_token_env);
                    envs.extend(c.user_token_env.as_deref());
                }
            }
            DataSource::GitLab => {
                if let Some(c) = &self.gitlab {
                    envs.push(&c.admin_token_env);
                }
            }
            DataSource::Slack => {
                if let Some(c) = &self.slack {
                    envs.push(&c.admin_token_env);
                    envs.extend(c.user_token_env.as_deref());
                }
            }
            DataSource::Dropbox => {
                if let Some(c) = &self.dropbox {
                    envs.push(&c.admin_token_env);
                }
            }
            DataSource::OneDrive => {
                if let Some(c) = &self.onedrive {
                    envs.push(&c.admin_token_env);
                }
            }
            DataSource::Confluence => {
                if let Some(c) = &self.confluence {
                    envs.push(&c.admin_token_env);
                    envs.push(&c.user_token_env);
                }
            }
            DataSource::Jira => {
                if let Some(c) = &self.jira {
                    envs.push(&c.admin_token_env);
                    envs.push(&c.user_token_env);
                }
            }
            DataSource::GDrive => {
                if let Some(c) = &self.gdrive {
                    envs.push(&c.admin_token_env);
                }
            }
        }
        envs
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubSourceConfig {
    #[serde(default = "default_github_base_url")]
    pub base_url: String,
    #[serde(default = "default_github_admin_env")]
    pub admin_token_env: String,
    /// Check a specific user through the collaborators endpoint.
    pub username: Option<String>,
    /// Check with the user's own token instead.
    pub user_token_env: Option<String>,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_github_base_url() -> String {
    "https://api.github.com".to_string()
}
fn default_github_admin_env() -> String {
    "GITHUB_ADMIN_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitLabSourceConfig {
    #[serde(default = "default_gitlab_base_url")]
    pub base_url: String,
    #[serde(default = "default_gitlab_admin_env")]
    pub admin_token_env: String,
    pub username: String,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_gitlab_base_url() -> String {
    "https://gitlab.com/api/v4".to_string()
}
fn default_gitlab_admin_env() -> String {
    "GITLAB_ADMIN_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackSourceConfig {
    #[serde(default = "default_slack_base_url")]
    pub base_url: String,
    #[serde(default = "default_slack_admin_env")]
    pub admin_token_env: String,
    /// Check this user's memberships with the admin token.
    pub user_email: Option<String>,
    /// Or check the memberships of the owner of this token.
    pub user_token_env: Option<String>,
}

fn default_slack_base_url() -> String {
    "https://slack.com/api".to_string()
}
fn default_slack_admin_env() -> String {
    "SLACK_ADMIN_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DropboxSourceConfig {
    #[serde(default = "default_dropbox_base_url")]
    pub base_url: String,
    #[serde(default = "default_dropbox_content_url")]
    pub content_url: String,
    #[serde(default = "default_dropbox_admin_env")]
    pub admin_token_env: String,
    pub user_email: String,
    /// Folder to read, `""` for the root.
    #[serde(default)]
    pub folder_path: String,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_dropbox_base_url() -> String {
    "https://api.dropboxapi.com/2".to_string()
}
fn default_dropbox_content_url() -> String {
    "https://content.dropboxapi.com/2".to_string()
}
fn default_dropbox_admin_env() -> String {
    "DROPBOX_ADMIN_TOKEN".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct OneDriveSourceConfig {
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,
    #[serde(default = "default_onedrive_admin_env")]
    pub admin_token_env: String,
    /// Whose access is checked; resolved to a user id once.
    pub user_email: String,
    /// Whose drive is read. Defaults to the token owner's drive.
    pub drive_owner: Option<String>,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}
fn default_onedrive_admin_env() -> String {
    "ONEDRIVE_ADMIN_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfluenceSourceConfig {
    /// Site URL including `/wiki`, e.g. `https://acme.atlassian.net/wiki`.
    pub base_url: String,
    pub admin_email: String,
    #[serde(default = "default_confluence_admin_env")]
    pub admin_token_env: String,
    pub user_email: String,
    #[serde(default = "default_confluence_user_env")]
    pub user_token_env: String,
    /// Space ids or keys to read. Empty reads every space the admin can see.
    #[serde(default)]
    pub spaces: Vec<String>,
}

fn default_confluence_admin_env() -> String {
    "CONFLUENCE_ADMIN_TOKEN".to_string()
}
fn default_confluence_user_env() -> String {
    "CONFLUENCE_USER_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct JiraSourceConfig {
    /// Site URL, e.g. `https://acme.atlassian.net`.
    pub base_url: String,
    pub admin_email: String,
    #[serde(default = "default_jira_admin_env")]
    pub admin_token_env: String,
    pub user_email: String,
    #[serde(default = "default_jira_user_env")]
    pub user_token_env: String,
    /// Issues to read. Empty reads everything the admin can see.
    #[serde(default)]
    pub jql: String,
}

fn default_jira_admin_env() -> String {
    "JIRA_ADMIN_TOKEN".to_string()
}
fn default_jira_user_env() -> String {
    "JIRA_USER_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GDriveSourceConfig {
    #[serde(default = "default_gdrive_base_url")]
    pub base_url: String,
    #[serde(default = "default_gdrive_admin_env")]
    pub admin_token_env: String,
    pub user_email: String,
    pub folder_id: String,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_gdrive_base_url() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}
fn default_gdrive_admin_env() -> String {
    "GDRIVE_ADMIN_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OAuthConfig {
    pub auth_url: String,
    pub token_url: String,
    pub client_id: String,
    #[serde(default = "default_oauth_host")]
    pub host: String,
    #[serde(default = "default_oauth_port")]
    pub port: u16,
    /// Extra query parameters for the authorization URL.
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
}

fn default_oauth_host() -> String {
    "localhost".to_string()
}
fn default_oauth_port() -> u16 {
    8080
}

/// Read a credential from the environment variable `name`.
pub fn env_token(name: &str) -> Result<String> {
    let value =
        std::env::var(name).with_context(|| format!("{} environment variable not set", name))?;
    if value.trim().is_empty() {
        bail!("{} environment variable is empty", name);
    }
    Ok(value)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.http.timeout_secs == 0 {
        bail!("http.timeout_secs must be > 0");
    }
    if config.filter.max_concurrency == 0 {
        bail!("filter.max_concurrency must be >= 1");
    }
    if config.filter.page_size == 0 {
        bail!("filter.page_size must be >= 1");
    }

    let sources = &config.sources;
    if let Some(github) = &sources.github {
        if github.username.is_none() && github.user_token_env.is_none() {
            bail!("sources.github needs either username or user_token_env");
        }
        PathFilter::new(&github.include_globs, &github.exclude_globs)
            .context("sources.github globs")?;
    }
    if let Some(gitlab) = &sources.gitlab {
        if gitlab.username.trim().is_empty() {
            bail!("sources.gitlab.username must not be empty");
        }
        PathFilter::new(&gitlab.include_globs, &gitlab.exclude_globs)
            .context("sources.gitlab globs")?;
    }
    if let Some(slack) = &sources.slack {
        if slack.user_email.is_none() && slack.user_token_env.is_none() {
            bail!("sources.slack needs either user_email or user_token_env");
        }
    }
    if let Some(dropbox) = &sources.dropbox {
        if dropbox.user_email.trim().is_empty() {
            bail!("sources.dropbox.user_email must not be empty");
        }
        PathFilter::new(&dropbox.include_globs, &dropbox.exclude_globs)
            .context("sources.dropbox globs")?;
    }
    if let Some(onedrive) = &sources.onedrive {
        if onedrive.user_email.trim().is_empty() {
            bail!("sources.onedrive.user_email must not be empty");
        }
        PathFilter::new(&onedrive.include_globs, &onedrive.exclude_globs)
            .context("sources.onedrive globs")?;
    }
    if let Some(confluence) = &sources.confluence {
        if confluence.base_url.trim().is_empty() {
            bail!("sources.confluence.base_url must not be empty");
        }
    }
    if let Some(jira) = &sources.jira {
        if jira.base_url.trim().is_empty() {
            bail!("sources.jira.base_url must not be empty");
        }
    }
    if let Some(gdrive) = &sources.gdrive {
        if gdrive.folder_id.trim().is_empty() {
            bail!("sources.gdrive.folder_id must not be empty");
        }
        PathFilter::new(&gdrive.include_globs, &gdrive.exclude_globs)
            .context("sources.gdrive globs")?;
    }

    for (name, oauth) in &config.oauth {
        if oauth.client_id.trim().is_empty() {
            bail!("oauth.{}.client_id must not be empty", name);
        }
        if oauth.port == 0 {
            bail!("oauth.{}.port must be > 0", name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.http.timeout_secs, 30);
        assert_eq!(config.filter.max_concurrency, 8);
        assert_eq!(config.filter.page_size, 100);
        assert!(config.sources.github.is_none());
        assert!(config.http.user_agent.starts_with("multipass/"));
    }

    #[test]
    fn test_minimal_is_valid() {
        validate(&Config::minimal()).unwrap();
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = parse("[http]\ntimeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        assert!(parse("[filter]\nmax_concurrency = 0\n").is_err());
    }

    #[test]
    fn test_github_needs_a_principal() {
        assert!(parse("[sources.github]\n").is_err());
        let config = parse("[sources.github]\nusername = \"octocat\"\n").unwrap();
        let github = config.sources.github.unwrap();
        assert_eq!(github.base_url, "https://api.github.com");
        assert_eq!(github.admin_token_env, "GITHUB_ADMIN_TOKEN");
    }

    #[test]
    fn test_rejects_bad_glob() {
        let err = parse("[sources.github]\nusername = \"u\"\ninclude_globs = [\"a[\"]\n").unwrap_err();
        assert!(format!("{:#}", err).contains("globs"));
    }

    #[test]
    fn test_credential_envs() {
        let config = parse(
            r#"
[sources.jira]
base_url = "https://acme.atlassian.net"
admin_email = "admin@acme.io"
user_email = "alice@acme.io"
"#,
        )
        .unwrap();
        assert_eq!(
            config.sources.credential_envs(DataSource::Jira),
            vec!["JIRA_ADMIN_TOKEN", "JIRA_USER_TOKEN"]
        );
        assert!(config.sources.credential_envs(DataSource::Slack).is_empty());
        assert!(config.sources.is_configured(DataSource::Jira));
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse(include_str!("../config/multipass.example.toml")).unwrap();
        for source in DataSource::ALL {
            assert!(config.sources.is_configured(source), "{} missing", source);
        }
        assert_eq!(config.oauth["dropbox"].extra_params["token_access_type"], "offline");
    }

    #[test]
    fn test_oauth_defaults() {
        let config = parse(
            r#"
[oauth.dropbox]
auth_url = "https://www.dropbox.com/oauth2/authorize"
token_url = "https://api.dropbox.com/oauth2/token"
client_id = "abc"
"#,
        )
        .unwrap();
        let oauth = &config.oauth["dropbox"];
        assert_eq!(oauth.host, "localhost");
        assert_eq!(oauth.port, 8080);
    }
}
