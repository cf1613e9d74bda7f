//! Proxy list download from the Webshare API.

use serde::Deserialize;
use tracing::info;

use super::{ProxyEndpoint, ProxyError};

pub const WEBSHARE_LIST_URL: &str = "https://proxy.webshare.io/api/v2/proxy/list/";

#[derive(Debug, Deserialize)]
struct ProxyListPage {
    #[serde(default)]
    results: Vec<WebshareProxy>,
}

#[derive(Debug, Deserialize)]
struct WebshareProxy {
    username: String,
    password: String,
    proxy_address: String,
    port: u16,
    #[serde(default)]
    valid: bool,
}

/// Parse a Webshare list response, keeping only proxies marked valid.
pub fn parse_webshare_response(body: &str) -> Result<Vec<ProxyEndpoint>, ProxyError> {
    let page: ProxyListPage =
        serde_json::from_str(body).map_err(|e| ProxyError::Webshare(e.to_string()))?;
    Ok(page
        .results
        .into_iter()
        .filter(|p| p.valid)
        .map(|p| {
            ProxyEndpoint::new(format!(
                "http://{}:{}@{}:{}",
                p.username, p.password, p.proxy_address, p.port
            ))
        })
        .collect())
}

/// Fetch the direct-mode proxy list for an API token.
pub async fn fetch_webshare_proxies(
    client: &reqwest::Client,
    api_token: &str,
    page_size: usize,
) -> Result<Vec<ProxyEndpoint>, ProxyError> {
    let response = client
        .get(WEBSHARE_LIST_URL)
        .query(&[
            ("mode", "direct".to_string()),
            ("page", "1".to_string()),
            ("page_size", page_size.to_string()),
        ])
        .header("Authorization", format!("Token {}", api_token))
        .send()
        .await
        .map_err(|e| ProxyError::Webshare(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ProxyError::Webshare(format!(
            "HTTP {} from proxy list API",
            response.status()
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| ProxyError::Webshare(e.to_string()))?;
    let proxies = parse_webshare_response(&body)?;
    info!("Fetched {} valid proxies from Webshare", proxies.len());
    Ok(proxies)
}
