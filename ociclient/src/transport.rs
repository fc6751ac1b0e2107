//! Authenticated HTTP request execution against a registry.
//!
//! Requests carry the current session's `Authorization` header. A `401`
//! with a `Bearer` challenge is answered by fetching a token from the
//! challenge realm and retrying the request once; the token then stays in
//! the session for every later request.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client as ReqwestClient, Method, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};

/// Registry login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn encode_basic(&self) -> String {
        BASE64.encode(format!("{}:{}", self.username, self.password))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authorization state of a transport. Moves from `Basic` to `Bearer` when a
/// registry challenges, never back.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum AuthSession {
    #[default]
    Anonymous,
    Basic(String),
    Bearer(String),
}

impl AuthSession {
    fn header_value(&self) -> Option<String> {
        match self {
            AuthSession::Anonymous => None,
            AuthSession::Basic(encoded) => Some(format!("Basic {}", encoded)),
            AuthSession::Bearer(token) => Some(format!("Bearer {}", token)),
        }
    }

    pub fn is_bearer(&self) -> bool {
        matches!(self, AuthSession::Bearer(_))
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthSession::Anonymous => write!(f, "Anonymous"),
            AuthSession::Basic(_) => write!(f, "Basic(..)"),
            AuthSession::Bearer(_) => write!(f, "Bearer(..)"),
        }
    }
}

/// Timeouts applied to every registry request.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in parse_auth_params(params) {
            match key.as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

// Values may be quoted and quoted values may contain commas
// (`scope="repository:ns/svc:pull,push"`).
fn parse_auth_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();

    while let Some((key, after)) = rest.split_once('=') {
        let key = key.trim().to_ascii_lowercase();
        let after = after.trim_start();

        let (value, remainder) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            },
            None => match after.find(',') {
                Some(end) => (after[..end].trim_end(), &after[end..]),
                None => (after.trim_end(), ""),
            },
        };

        params.push((key, value.to_string()));
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

// Token authentication response from the auth service
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Low-level registry request executor.
pub struct Transport {
    base_url: Url,
    client: ReqwestClient,
    basic: Option<String>,
    session: RwLock<AuthSession>,
}

impl Transport {
    /// Create an anonymous transport for `host`.
    ///
    /// A scheme given with the host is kept; otherwise plain `http://` is used.
    pub fn new(host: &str, options: &TransportOptions) -> Result<Self> {
        let base_url = normalize_base_url(host)?;
        let client = ReqwestClient::builder()
            .timeout(options.request_timeout)
            .connect_timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            base_url,
            client,
            basic: None,
            session: RwLock::new(AuthSession::Anonymous),
        })
    }

    /// Create a transport for `host`, log in with `credentials` and probe the API.
    pub async fn connect(
        host: &str,
        credentials: Option<&Credentials>,
        options: &TransportOptions,
    ) -> Result<Self> {
        let mut transport = Self::new(host, options)?;
        transport.authenticate(credentials).await;
        Ok(transport)
    }

    /// Switch to Basic auth when credentials are given, then probe `GET /v2/`.
    ///
    /// The probe only reports problems; it never fails authentication.
    pub async fn authenticate(&mut self, credentials: Option<&Credentials>) {
        if let Some(credentials) = credentials {
            let encoded = credentials.encode_basic();
            self.basic = Some(encoded.clone());
            *self.session.get_mut() = AuthSession::Basic(encoded);
        }

        let url = match self.resolve("/v2/") {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Cannot build registry probe URL");
                return;
            }
        };

        match self.send(&Method::GET, &url, None, &HeaderMap::new()).await {
            Ok(response) if response.status().is_success() => {
                info!(registry = %self.base_url, "Registry API is reachable");
            }
            Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                debug!(registry = %self.base_url, "Registry expects token authentication");
            }
            Ok(response) => {
                warn!(
                    registry = %self.base_url,
                    status = %response.status(),
                    "Registry API probe returned an unexpected status"
                );
            }
            Err(e) => {
                warn!(registry = %self.base_url, error = %e, "Registry API probe failed");
            }
        }
    }

    /// Base URL every relative request path is resolved against
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Current authorization state
    pub async fn session(&self) -> AuthSession {
        self.session.read().await.clone()
    }

    /// Resolve a registry path or an absolute URL (such as an upload location).
    pub fn resolve(&self, path: &str) -> Result<Url> {
        let resolved = if path.starts_with("http://") || path.starts_with("https://") {
            Url::parse(path)
        } else {
            self.base_url.join(path)
        };
        resolved.map_err(|e| Error::InvalidUrl {
            url: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Issue one request, answering a Bearer challenge with a single retry.
    ///
    /// Any non-2xx final response becomes [`Error::RegistryRequest`].
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
        headers: HeaderMap,
    ) -> Result<Response> {
        let url = self.resolve(path)?;
        let response = self.send(&method, &url, body.clone(), &headers).await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .and_then(BearerChallenge::parse);

            match challenge {
                Some(challenge) => {
                    debug!(
                        realm = %challenge.realm,
                        scope = ?challenge.scope,
                        "Registry issued a bearer challenge"
                    );
                    let token = self.fetch_token(&challenge).await?;
                    *self.session.write().await = AuthSession::Bearer(token);
                    self.send(&method, &url, body, &headers).await?
                }
                None => response,
            }
        } else {
            response
        };

        ensure_success(method, &url, response).await
    }

    async fn send(
        &self,
        method: &Method,
        url: &Url,
        body: Option<Bytes>,
        headers: &HeaderMap,
    ) -> Result<Response> {
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers.clone());

        if let Some(value) = self.session.read().await.header_value() {
            request = request.header(header::AUTHORIZATION, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String> {
        let token_error = |reason: String| Error::TokenRequest {
            realm: challenge.realm.clone(),
            reason,
        };

        let mut token_url = Url::parse(&challenge.realm).map_err(|e| Error::InvalidUrl {
            url: challenge.realm.clone(),
            reason: e.to_string(),
        })?;
        if challenge.service.is_some() || challenge.scope.is_some() {
            let mut query = token_url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair("service", service);
            }
            if let Some(scope) = &challenge.scope {
                query.append_pair("scope", scope);
            }
        }

        let mut request = self.client.get(token_url);
        if let Some(basic) = &self.basic {
            request = request.header(header::AUTHORIZATION, format!("Basic {}", basic));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(token_error(format!("{}: {}", status, body)));
        }

        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| token_error("response carries no token".to_string()))
    }
}

async fn ensure_success(method: Method, url: &Url, response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(Error::RegistryRequest {
        method,
        url: url.to_string(),
        status,
        body,
    })
}

fn normalize_base_url(host: &str) -> Result<Url> {
    let host = host.trim().trim_end_matches('/');
    let with_scheme = if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}/", host)
    } else {
        format!("http://{}/", host)
    };

    Url::parse(&with_scheme).map_err(|e| Error::InvalidUrl {
        url: host.to_string(),
        reason: e.to_string(),
    })
}
