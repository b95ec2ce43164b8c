//! OAuth 2.0 authorization-code flow with PKCE, for acquiring user tokens.
//!
//! ```text
//! mpass oauth <name>
//!   1. generate verifier + S256 challenge
//!   2. print the authorization URL
//!   3. serve one callback on http://{host}:{port}  ──code──▶ oneshot
//!   4. POST code + verifier to the token URL
//! ```
//!
//! Tokens are printed, never stored.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::OAuthConfig;

/// How long to wait for the browser to come back.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

/// A fresh verifier (32 random bytes, URL-safe base64) and its S256
/// challenge.
pub fn generate_pkce_pair() -> PkcePair {
    let mut random = [0u8; 32];
    random[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    random[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    let verifier = URL_SAFE_NO_PAD.encode(random);
    let challenge = pkce_challenge(&verifier);
    PkcePair { verifier, challenge }
}

pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Token endpoint response. Provider-specific fields are kept in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
}

type CodeSender = Arc<Mutex<Option<oneshot::Sender<std::result::Result<String, String>>>>>;

async fn callback(State(sender): State<CodeSender>, Query(params): Query<CallbackParams>) -> impl IntoResponse {
    let outcome = match (params.code, params.error) {
        (Some(code), _) if !code.is_empty() => Ok(code),
        (_, Some(error)) => Err(error),
        _ => Err("callback carried no code".to_string()),
    };
    let ok = outcome.is_ok();

    let sender = sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(sender) = sender {
        let _ = sender.send(outcome);
    }

    if ok {
        (
            StatusCode::OK,
            Html("<h1>Authorization successful</h1><p>You can close this tab.</p>"),
        )
    } else {
        (StatusCode::BAD_REQUEST, Html("<h1>Authorization failed</h1><p>You can close this tab.</p>"))
    }
}

/// Serve callbacks on `listener` until the first one arrives, and return
/// its authorization code.
pub async fn wait_for_code(listener: TcpListener, timeout: Duration) -> Result<String> {
    let (code_tx, code_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let sender: CodeSender = Arc::new(Mutex::new(Some(code_tx)));

    let app = Router::new().route("/", get(callback)).with_state(sender);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let received = tokio::time::timeout(timeout, code_rx).await;
    let _ = stop_tx.send(());
    server
        .await
        .context("OAuth callback server panicked")?
        .context("OAuth callback server failed")?;

    match received {
        Err(_) => bail!("no OAuth callback within {:?}", timeout),
        Ok(Err(_)) => bail!("OAuth callback server stopped without a code"),
        Ok(Ok(Err(error))) => bail!("authorization denied: {}", error),
        Ok(Ok(Ok(code))) => Ok(code),
    }
}

/// A configured provider.
pub struct OAuthFlow {
    config: OAuthConfig,
    http: reqwest::Client,
}

impl OAuthFlow {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://{}:{}", self.config.host, self.config.port)
    }

    pub fn authorization_url(&self, challenge: &str) -> Result<String> {
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", self.config.client_id.as_str()),
            ("response_type", "code"),
        ];
        let redirect_uri = self.redirect_uri();
        params.push(("redirect_uri", &redirect_uri));
        params.push(("code_challenge", challenge));
        params.push(("code_challenge_method", "S256"));
        params.extend(self.config.extra_params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let url = Url::parse_with_params(&self.config.auth_url, &params)
            .with_context(|| format!("invalid auth_url: {}", self.config.auth_url))?;
        Ok(url.into())
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(form)
            .send()
            .await
            .with_context(|| format!("token request to {} failed", self.config.token_url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("token endpoint returned {}: {}", status, body);
        }
        response
            .json::<TokenResponse>()
            .await
            .context("token endpoint returned an invalid body")
    }

    pub async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenResponse> {
        let redirect_uri = self.redirect_uri();
        self.token_request(&[
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &redirect_uri),
            ("code_verifier", verifier),
        ])
        .await
    }

    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ])
        .await
    }

    /// Run the whole flow; the user opens the printed URL in a browser.
    pub async fn run_pkce(&self) -> Result<TokenResponse> {
        let pair = generate_pkce_pair();
        let url = self.authorization_url(&pair.challenge)?;

        let bind = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("cannot listen for the OAuth callback on {}", bind))?;

        println!("Open this URL to authorize:\n\n  {}\n", url);
        info!(redirect_uri = %self.redirect_uri(), "waiting for OAuth callback");

        let code = wait_for_code(listener, CALLBACK_TIMEOUT).await?;
        debug!("received authorization code");
        self.exchange_code(&code, &pair.verifier).await
    }
}

pub async fn run_oauth(config: &crate::config::Config, name: &str) -> Result<()> {
    let Some(provider) = config.oauth.get(name) else {
        let known: Vec<&str> = config.oauth.keys().map(String::as_str).collect();
        bail!(
            "unknown OAuth provider '{}'. Configured: {}",
            name,
            if known.is_empty() { "(none)".to_string() } else { known.join(", ") }
        );
    };
    let token = OAuthFlow::new(provider.clone()).run_pkce().await?;
    println!("{}", serde_json::to_string_pretty(&token)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::routing::post;
    use axum::Form;

    use super::*;

    fn provider(token_url: &str) -> OAuthConfig {
        let mut extra_params = BTreeMap::new();
        extra_params.insert("token_access_type".to_string(), "offline".to_string());
        OAuthConfig {
            auth_url: "https://auth.example.com/oauth2/authorize".into(),
            token_url: token_url.into(),
            client_id: "client-1".into(),
            host: "127.0.0.1".into(),
            port: 8765,
            extra_params,
        }
    }

    #[test]
    fn test_pkce_pair() {
        let pair = generate_pkce_pair();
        assert_eq!(pair.verifier.len(), 43);
        assert_eq!(pair.challenge, pkce_challenge(&pair.verifier));
        assert_ne!(pair.verifier, generate_pkce_pair().verifier);
    }

    #[test]
    fn test_challenge_matches_rfc7636_example() {
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_authorization_url() {
        let flow = OAuthFlow::new(provider("https://auth.example.com/token"));
        let url = Url::parse(&flow.authorization_url("abc").unwrap()).unwrap();
        let params: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client-1");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "http://127.0.0.1:8765");
        assert_eq!(params["code_challenge"], "abc");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["token_access_type"], "offline");
    }

    #[tokio::test]
    async fn test_callback_hands_over_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let waiter = tokio::spawn(wait_for_code(listener, Duration::from_secs(5)));

        let response = reqwest::get(format!("http://{}/?code=xyz&state=s", addr)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(waiter.await.unwrap().unwrap(), "xyz");
    }

    #[tokio::test]
    async fn test_callback_error_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let waiter = tokio::spawn(wait_for_code(listener, Duration::from_secs(5)));

        let response = reqwest::get(format!("http://{}/?error=access_denied", addr)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("access_denied"));
    }

    #[tokio::test]
    async fn test_exchange_code_posts_verifier() {
        async fn token(Form(form): Form<BTreeMap<String, String>>) -> axum::Json<serde_json::Value> {
            assert_eq!(form["grant_type"], "authorization_code");
            assert_eq!(form["code_verifier"], "verifier-1");
            axum::Json(serde_json::json!({
                "access_token": format!("at-{}", form["code"]),
                "refresh_token": "rt",
                "expires_in": 3600,
                "account_id": "dbid:1",
            }))
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/token", post(token)))
                .await
                .unwrap();
        });

        let flow = OAuthFlow::new(provider(&format!("http://{}/token", addr)));
        let tokens = flow.exchange_code("c1", "verifier-1").await.unwrap();
        assert_eq!(tokens.access_token, "at-c1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
        assert_eq!(tokens.extra["account_id"], "dbid:1");
    }
}
