//! HTTP transport with per-proxy clients.
//!
//! reqwest binds a proxy to a `Client`, so [`HttpClient`] keeps one direct
//! client and lazily builds one client per proxy endpoint. Everything above
//! this layer talks to the [`Transport`] trait so it can be faked in tests.

mod response;
mod user_agent;

pub use response::{snippet, RawResponse};
pub use user_agent::{browser_headers, random_user_agent, resolve_user_agent, USER_AGENT};

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Proxy};
use tracing::debug;

use crate::proxy::ProxyEndpoint;
use crate::session::Session;

/// Failure below the HTTP status level.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("invalid proxy {proxy}: {reason}")]
    InvalidProxy { proxy: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

/// One outgoing GET request.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub url: &'a str,
    /// `None` means a direct (local) connection.
    pub proxy: Option<&'a ProxyEndpoint>,
    pub session: Option<&'a Session>,
    /// Attach `Authorization: Bearer` from the session.
    pub authorize: bool,
    /// Extra headers for this request only.
    pub headers: &'a [(String, String)],
}

impl<'a> PageRequest<'a> {
    /// Plain direct request with no session.
    pub fn direct(url: &'a str) -> Self {
        Self {
            url,
            proxy: None,
            session: None,
            authorize: false,
            headers: &[],
        }
    }

    pub fn via(mut self, proxy: Option<&'a ProxyEndpoint>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_session(mut self, session: Option<&'a Session>) -> Self {
        self.session = session;
        self
    }
}

/// Something that can perform a GET and return the whole body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: PageRequest<'_>) -> Result<RawResponse, TransportError>;
}

/// Builder for [`HttpClient`].
pub struct HttpClientBuilder {
    timeout: Duration,
    user_agent: Option<String>,
    default_headers: Vec<(String, String)>,
}

impl HttpClientBuilder {
    /// Set the user agent string.
    /// - `"impersonate"`: Use random real browser user agent
    /// - Any other string: Use as-is
    /// - Not called: Use the default Chrome user agent
    pub fn user_agent(mut self, ua: &str) -> Self {
        self.user_agent = Some(ua.to_string());
        self
    }

    /// Set the per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the headers sent with every request.
    pub fn default_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.default_headers = headers;
        self
    }

    /// Build the `HttpClient`.
    pub fn build(self) -> Result<HttpClient, TransportError> {
        let user_agent = resolve_user_agent(self.user_agent.as_deref());
        let direct = build_client(&user_agent, self.timeout, None)?;
        Ok(HttpClient {
            direct,
            proxied: Mutex::new(HashMap::new()),
            user_agent,
            timeout: self.timeout,
            default_headers: self.default_headers,
        })
    }
}

/// reqwest-backed [`Transport`].
pub struct HttpClient {
    direct: Client,
    proxied: Mutex<HashMap<String, Client>>,
    user_agent: String,
    timeout: Duration,
    default_headers: Vec<(String, String)>,
}

impl HttpClient {
    /// Create a builder with browser headers and a 15 second timeout.
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder {
            timeout: Duration::from_secs(15),
            user_agent: None,
            default_headers: browser_headers(),
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Client for the given route, building and caching proxy clients on demand.
    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<Client, TransportError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let mut cache = self
            .proxied
            .lock()
            .map_err(|_| TransportError::Build("proxy client cache poisoned".to_string()))?;
        if let Some(client) = cache.get(proxy.url()) {
            return Ok(client.clone());
        }
        let client = build_client(&self.user_agent, self.timeout, Some(proxy))?;
        debug!("Built HTTP client for proxy {}", proxy);
        cache.insert(proxy.url().to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn get(&self, request: PageRequest<'_>) -> Result<RawResponse, TransportError> {
        let client = self.client_for(request.proxy)?;
        let mut builder = client.get(request.url);

        for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(session) = request.session {
            if let Some(cookie) = session.cookie_header() {
                builder = builder.header("cookie", cookie);
            }
            if request.authorize {
                builder = builder.bearer_auth(&session.bearer_token);
            }
        }

        let response = builder.send().await.map_err(|e| map_error(e, self.timeout))?;
        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response::extract_response_headers(&response);
        let body = response
            .text()
            .await
            .map_err(|e| map_error(e, self.timeout))?;

        Ok(RawResponse {
            status,
            final_url,
            headers,
            body,
        })
    }
}

fn map_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Connection(err.to_string())
    }
}

fn build_client(
    user_agent: &str,
    timeout: Duration,
    proxy: Option<&ProxyEndpoint>,
) -> Result<Client, TransportError> {
    let mut builder = Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .gzip(true)
        .brotli(true);

    if let Some(endpoint) = proxy {
        let proxy = Proxy::all(endpoint.url()).map_err(|e| TransportError::InvalidProxy {
            proxy: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| TransportError::Build(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[test]
    fn test_builder_defaults() {
        let client = HttpClient::builder().build().unwrap();
        assert_eq!(client.user_agent(), USER_AGENT);
        assert_eq!(client.timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_builder_custom_user_agent() {
        let client = HttpClient::builder()
            .user_agent("TestAgent/1.0")
            .timeout(test_timeout())
            .build()
            .unwrap();
        assert_eq!(client.user_agent(), "TestAgent/1.0");
        assert_eq!(client.timeout(), test_timeout());
    }

    #[test]
    fn test_proxy_clients_are_cached() {
        let client = HttpClient::builder().build().unwrap();
        let proxy = ProxyEndpoint::parse_line("10.0.0.1:8080:user:pass").unwrap();
        client.client_for(Some(&proxy)).unwrap();
        client.client_for(Some(&proxy)).unwrap();
        assert_eq!(client.proxied.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_proxy_is_reported() {
        let proxy = ProxyEndpoint::new("http://exa mple.com:99999");
        let err = build_client(USER_AGENT, test_timeout(), Some(&proxy)).unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.contains("invalid proxy"),
            "Expected invalid proxy error, got: {}",
            msg
        );
    }

    #[test]
    fn test_page_request_builders() {
        let proxy = ProxyEndpoint::new("http://10.0.0.1:8080");
        let request = PageRequest::direct("https://www.njuskalo.hr/").via(Some(&proxy));
        assert!(request.proxy.is_some());
        assert!(request.session.is_none());
        assert!(!request.authorize);
    }
}
