//! HTTP plumbing shared by every connector.
//!
//! [`ApiClient`] wraps a `reqwest::Client` bound to one source, one base URL
//! and one credential, and maps failures onto the core error taxonomy:
//!
//! | Outcome | Error |
//! |---------|-------|
//! | transport error, timeout | `SourceUnavailable` |
//! | 401, 403 | `InsufficientPermissions` |
//! | any other non-2xx | `SourceUnavailable` |
//!
//! Statuses that mean "no access" for a particular endpoint (usually 404)
//! are handled by the connector before they reach [`ApiClient::status_error`].

use std::fmt;

use anyhow::Context;
use multipass_core::{DataSource, MultipassError, Result};
use reqwest::header::{HeaderMap, AUTHORIZATION, LINK};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::HttpConfig;

/// How a credential is presented.
#[derive(Clone)]
pub enum Auth {
    Bearer(String),
    /// `Authorization: token <pat>`, as GitHub documents it.
    Token(String),
    /// Atlassian-style `email:api_token`.
    Basic { user: String, secret: String },
}

impl Auth {
    fn secret(&self) -> &str {
        match self {
            Auth::Bearer(token) | Auth::Token(token) => token,
            Auth::Basic { secret, .. } => secret,
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Auth::Token(_) => f.write_str("Token(<redacted>)"),
            Auth::Basic { user, .. } => write!(f, "Basic({}, <redacted>)", user),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth: Auth,
    source: DataSource,
}

impl ApiClient {
    pub fn new(
        source: DataSource,
        base_url: &str,
        auth: Auth,
        config: &HttpConfig,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            source,
        })
    }

    pub fn source(&self) -> DataSource {
        self.source
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URLs (pagination links) pass through unchanged.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// Base URL extended with percent-encoded path segments, for identifiers
    /// that may contain `/` or spaces.
    pub fn url_with_segments(&self, segments: &[&str]) -> Result<String> {
        let invalid = |reason: String| MultipassError::unavailable(self.source, &self.base_url, reason);
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("base URL cannot have path segments".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url.into())
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.http.request(method, self.url(path));
        match &self.auth {
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Token(token) => request.header(AUTHORIZATION, format!("token {}", token)),
            Auth::Basic { user, secret } => request.basic_auth(user, Some(secret)),
        }
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    /// Send without looking at the status.
    pub async fn send(&self, request: RequestBuilder, target: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                "request timed out".to_string()
            } else {
                e.to_string()
            };
            MultipassError::unavailable(self.source, target, reason)
        })?;
        debug!(source = %self.source, target, status = response.status().as_u16(), "http response");
        Ok(response)
    }

    /// Send and require a 2xx status.
    pub async fn send_ok(&self, request: RequestBuilder, target: &str) -> Result<Response> {
        let response = self.send(request, target).await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(self.status_error(status, target))
        }
    }

    pub async fn json<T: DeserializeOwned>(&self, request: RequestBuilder, target: &str) -> Result<T> {
        let response = self.send_ok(request, target).await?;
        self.decode(response, target).await
    }

    pub async fn decode<T: DeserializeOwned>(&self, response: Response, target: &str) -> Result<T> {
        response.json::<T>().await.map_err(|e| {
            MultipassError::unavailable(self.source, target, format!("invalid response body: {}", e))
        })
    }

    pub async fn bytes(&self, request: RequestBuilder, target: &str) -> Result<Vec<u8>> {
        let response = self.send_ok(request, target).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| MultipassError::unavailable(self.source, target, e.to_string()))?;
        Ok(body.to_vec())
    }

    pub fn status_error(&self, status: StatusCode, target: &str) -> MultipassError {
        classify_status(self.source, status, target)
    }

    /// Stable, non-reversible identity of this client's credential.
    pub fn fingerprint(&self) -> String {
        credential_fingerprint(self.auth.secret())
    }
}

/// Error for a status the endpoint gave no special meaning.
pub fn classify_status(source: DataSource, status: StatusCode, target: &str) -> MultipassError {
    let reason = format!("HTTP {}", status.as_u16());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            MultipassError::insufficient(source, target, reason)
        }
        _ => MultipassError::unavailable(source, target, reason),
    }
}

pub fn credential_fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    format!("cred:{}", &hex::encode(digest)[..16])
}

/// The `rel="next"` target of an RFC 8288 `Link` header.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(LINK)?.to_str().ok()?;
    value.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(
            DataSource::GitLab,
            base,
            Auth::Bearer("glpat-secret".into()),
            &HttpConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_url_joins_and_passes_absolute() {
        let c = client("https://gitlab.example.com/api/v4/");
        assert_eq!(c.url("/projects"), "https://gitlab.example.com/api/v4/projects");
        assert_eq!(
            c.url("https://gitlab.example.com/api/v4/projects?page=2"),
            "https://gitlab.example.com/api/v4/projects?page=2"
        );
    }

    #[test]
    fn test_url_with_segments_encodes() {
        let c = client("https://gitlab.example.com/api/v4");
        let url = c
            .url_with_segments(&["projects", "7", "repository", "files", "docs/a b.md", "raw"])
            .unwrap();
        assert_eq!(
            url,
            "https://gitlab.example.com/api/v4/projects/7/repository/files/docs%2Fa%20b.md/raw"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(DataSource::GitHub, StatusCode::FORBIDDEN, "repo"),
            MultipassError::InsufficientPermissions { .. }
        ));
        assert!(matches!(
            classify_status(DataSource::GitHub, StatusCode::UNAUTHORIZED, "repo"),
            MultipassError::InsufficientPermissions { .. }
        ));
        let err = classify_status(DataSource::GitHub, StatusCode::BAD_GATEWAY, "repo");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_fingerprint_hides_secret() {
        let c = client("https://gitlab.example.com");
        let fp = c.fingerprint();
        assert!(!fp.contains("glpat"));
        assert_eq!(fp, credential_fingerprint("glpat-secret"));
        assert_ne!(fp, credential_fingerprint("other"));
        assert!(!format!("{:?}", c).contains("glpat-secret"));
    }

    #[test]
    fn test_next_link() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://gitlab.com/api/v4/projects?page=1>; rel=\"prev\", <https://gitlab.com/api/v4/projects?page=3>; rel=\"next\"",
            ),
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("https://gitlab.com/api/v4/projects?page=3")
        );

        headers.insert(LINK, HeaderValue::from_static("<https://x/1>; rel=\"last\""));
        assert_eq!(next_link(&headers), None);
        assert_eq!(next_link(&HeaderMap::new()), None);
    }
}
