use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::ConfigError;
use crate::miniapp::ExtractError;

/// Statuses the backend uses for an expired or rejected token. 418 and 502
/// are included because the backend hides auth rejections behind them.
const RELOGIN_STATUSES: [StatusCode; 4] = [
    StatusCode::UNAUTHORIZED,
    StatusCode::FORBIDDEN,
    StatusCode::IM_A_TEAPOT,
    StatusCode::BAD_GATEWAY,
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum SessionError {
    /// Fatal for the account: the session cannot be re-established.
    InvalidSession(String),
    Http(reqwest::Error),
    Serialize(serde_json::Error),
    Config(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidSession(msg) => write!(f, "Invalid session: {}", msg),
            SessionError::Http(e) => write!(f, "HTTP error: {}", e),
            SessionError::Serialize(e) => write!(f, "Serialization error: {}", e),
            SessionError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Http(e) => Some(e),
            SessionError::Serialize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::Http(err)
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Serialize(err)
    }
}

impl From<ConfigError> for SessionError {
    fn from(err: ConfigError) -> Self {
        SessionError::Config(err.to_string())
    }
}

impl From<url::ParseError> for SessionError {
    fn from(err: url::ParseError) -> Self {
        SessionError::Config(err.to_string())
    }
}

// Token extraction failures leave no usable partial credential.
impl From<ExtractError> for SessionError {
    fn from(err: ExtractError) -> Self {
        SessionError::InvalidSession(err.to_string())
    }
}

/// Hook the client invokes when the backend reports an auth failure. The
/// implementor must re-derive the mini-app token and complete a fresh login,
/// rotating the stored token before returning `Ok(true)`.
#[async_trait]
pub trait Reauthenticate: Send + Sync {
    async fn relogin(&self) -> Result<bool, SessionError>;
}

/// HTTP transport for one account: a cookie-keeping `reqwest::Client` with an
/// optional proxy binding and the one-shot relogin-and-retry policy.
pub struct SessionClient {
    http: Client,
    jar: Arc<Jar>,
    default_headers: HeaderMap,
    current_proxy: Option<String>,
}

fn build_client(
    default_headers: &HeaderMap,
    jar: Arc<Jar>,
    proxy: Option<&str>,
) -> Result<Client, SessionError> {
    let mut builder = Client::builder()
        .default_headers(default_headers.clone())
        .cookie_provider(jar)
        .timeout(REQUEST_TIMEOUT);
    if let Some(addr) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(addr)?);
    }
    Ok(builder.build()?)
}

impl SessionClient {
    pub fn new(default_headers: HeaderMap, proxy: Option<&str>) -> Result<Self, SessionError> {
        let jar = Arc::new(Jar::default());
        let http = build_client(&default_headers, jar.clone(), proxy)?;
        Ok(Self {
            http,
            jar,
            default_headers,
            current_proxy: proxy.map(str::to_string),
        })
    }

    pub fn current_proxy(&self) -> Option<&str> {
        self.current_proxy.as_deref()
    }

    /// Replaces the egress proxy. The new connection pool is built before the
    /// old one is dropped; the cookie jar carries over so the identity-key
    /// cookie survives the swap.
    pub fn set_proxy(&mut self, proxy: Option<&str>) -> Result<(), SessionError> {
        let http = build_client(&self.default_headers, self.jar.clone(), proxy)?;
        self.http = http;
        self.current_proxy = proxy.map(str::to_string);
        Ok(())
    }

    /// Reads one cookie value stored for `base` out of the jar.
    pub fn cookie_value(&self, base: &Url, name: &str) -> Option<String> {
        let header = self.jar.cookies(base)?;
        let raw = header.to_str().ok()?;
        raw.split(';').map(str::trim).find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    }

    /// POSTs `body` to `url` and parses the JSON reply.
    ///
    /// At most two attempts: an auth status (401/403/418/502) on the first
    /// attempt triggers exactly one relogin through `reauth` and one retry;
    /// an auth status on the retry, or a failed relogin, is an invalid
    /// session. Every other non-200 status and any transport error is logged
    /// and collapsed to `Ok(None)` — absence of data is for the caller to
    /// judge.
    pub async fn request_json(
        &self,
        url: &str,
        headers: HeaderMap,
        body: String,
        skip_relogin: bool,
        reauth: &dyn Reauthenticate,
    ) -> Result<Option<Value>, SessionError> {
        for attempt in 0..2 {
            let response = match self
                .http
                .post(url)
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    error!("Request error for {}: {}", url, e);
                    return Ok(None);
                }
            };

            let status = response.status();
            if status == StatusCode::OK {
                return match response.json::<Value>().await {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        warn!("Unparseable 200 response from {}: {}", url, e);
                        Ok(None)
                    }
                };
            }

            if RELOGIN_STATUSES.contains(&status) && !skip_relogin {
                warn!("Access token expired or server error ({}) on {}", status, url);
                if let Ok(text) = response.text().await {
                    debug!("Error response body: {}", text);
                }
                if attempt > 0 {
                    return Err(SessionError::InvalidSession(format!(
                        "auth failure repeated after relogin ({})",
                        status
                    )));
                }
                if reauth.relogin().await? {
                    info!("Re-login succeeded, retrying request");
                    continue;
                }
                return Err(SessionError::InvalidSession(
                    "access token expired and could not be refreshed".to_string(),
                ));
            }

            match response.text().await {
                Ok(text) => error!("Request to {} failed with status {}: {}", url, status, text),
                Err(_) => error!("Request to {} failed with status {}", url, status),
            }
            return Ok(None);
        }
        Ok(None)
    }
}
