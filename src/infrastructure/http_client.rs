//! HTTP transport with per-proxy clients and rate limiting
//!
//! One `reqwest::Client` is built per distinct proxy (and redirect policy)
//! and cached for the rest of the run. Cookies are never stored by the
//! client; they travel in the execution context and are sent explicitly.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, COOKIE, USER_AGENT};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::proxy::ProxyEndpoint;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Proxy chains are not supported by the HTTP client: {0}")]
    UnsupportedChain(String),

    #[error("Invalid proxy {proxy}: {message}")]
    InvalidProxy { proxy: String, message: String },

    #[error("Invalid header '{0}'")]
    InvalidHeader(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Request cancelled")]
    Cancelled,
}

/// HTTP client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    /// 0 disables the limiter
    pub max_requests_per_second: u32,
    pub follow_redirects: bool,
    pub accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("bulkcheck/{}", env!("CARGO_PKG_VERSION")),
            max_requests_per_second: 0,
            follow_redirects: true,
            accept_invalid_certs: false,
        }
    }
}

/// Outgoing request, already template-resolved
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub cookies: IndexMap<String, String>,
    pub body: Option<String>,
    pub content_type: Option<String>,
    pub timeout: Duration,
    pub follow_redirects: bool,
}

impl TransportRequest {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            cookies: IndexMap::new(),
            body: None,
            content_type: None,
            timeout: Duration::from_secs(30),
            follow_redirects: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Final address after redirects
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub cookies: IndexMap<String, String>,
    pub body: String,
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct HttpTransport {
    config: HttpConfig,
    clients: Mutex<HashMap<(String, bool), Client>>,
    rate_limiter: Option<DirectLimiter>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("config", &self.config)
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, TransportError> {
        HeaderValue::from_str(&config.user_agent)
            .map_err(|_| TransportError::InvalidHeader(config.user_agent.clone()))?;
        let rate_limiter = NonZeroU32::new(config.max_requests_per_second)
            .map(|per_second| RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            config: config.clone(),
            clients: Mutex::new(HashMap::new()),
            rate_limiter,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Client for this proxy and redirect policy, built on first use
    fn client_for(
        &self,
        proxy: Option<&ProxyEndpoint>,
        follow_redirects: bool,
    ) -> Result<Client, TransportError> {
        let key = (
            proxy.map_or_else(String::new, ToString::to_string),
            follow_redirects,
        );
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.config.user_agent)
                .map_err(|_| TransportError::InvalidHeader(self.config.user_agent.clone()))?,
        );

        let mut builder = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(self.config.accept_invalid_certs)
            .redirect(if follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            });
        builder = match proxy {
            Some(endpoint) => builder.proxy(to_reqwest_proxy(endpoint)?),
            None => builder.no_proxy(),
        };
        let client = builder
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Drops the clients built for proxies; direct clients are kept.
    /// Called whenever the proxy list is replaced.
    pub fn clear_proxy_clients(&self) -> usize {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let before = clients.len();
        clients.retain(|(proxy, _), _| proxy.is_empty());
        let dropped = before - clients.len();
        if dropped > 0 {
            debug!("Dropped {} cached proxy clients", dropped);
        }
        dropped
    }

    #[cfg(test)]
    fn cached_clients(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Sends one request; the rate limiter wait and the request itself are
    /// both abandoned when `cancel` fires
    pub async fn send(
        &self,
        request: TransportRequest,
        proxy: Option<&ProxyEndpoint>,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if let Some(limiter) = &self.rate_limiter {
            tokio::select! {
                () = limiter.until_ready() => {},
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
        }

        let client = self.client_for(proxy, request.follow_redirects)?;
        let mut builder = client
            .request(request.method.clone(), &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::InvalidHeader(value.clone()))?;
            builder = builder.header(name, value);
        }
        if !request.cookies.is_empty() {
            let cookie_line = request
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(COOKIE, cookie_line);
        }
        if let Some(content_type) = &request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let url = request.url;
        let failed = |e: reqwest::Error| TransportError::Request {
            url: url.clone(),
            message: e.to_string(),
        };

        let response = tokio::select! {
            result = builder.send() => result.map_err(failed)?,
            () = cancel.cancelled() => {
                tracing::warn!("🛑 HTTP request cancelled for URL: {}", url);
                return Err(TransportError::Cancelled);
            }
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let cookies = response
            .cookies()
            .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
            .collect();

        let body = tokio::select! {
            result = response.text() => result.map_err(failed)?,
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
        };

        tracing::debug!("Fetched {} ({}, {} chars)", final_url, status, body.len());
        Ok(TransportResponse {
            status,
            url: final_url,
            headers,
            cookies,
            body,
        })
    }
}

/// Proxy settings for the first hop; chains cannot be expressed by the client
pub fn to_reqwest_proxy(endpoint: &ProxyEndpoint) -> Result<reqwest::Proxy, TransportError> {
    if endpoint.is_chained() {
        return Err(TransportError::UnsupportedChain(endpoint.to_string()));
    }
    let proxy = reqwest::Proxy::all(endpoint.url()).map_err(|e| TransportError::InvalidProxy {
        proxy: endpoint.to_string(),
        message: e.to_string(),
    })?;
    Ok(match (&endpoint.username, &endpoint.password) {
        (Some(user), Some(pass)) => proxy.basic_auth(user, pass),
        (Some(user), None) => proxy.basic_auth(user, ""),
        _ => proxy,
    })
}
