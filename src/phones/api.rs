//! Phone-number API client.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::http_client::{snippet, PageRequest, Transport};
use crate::session::Session;

pub const PHONE_API_BASE: &str = "https://www.njuskalo.hr/ccapi/v4/phone-numbers/ad";

/// Result of one phone lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneLookup {
    /// Lookup succeeded. Empty when the ad lists no numbers.
    Numbers(Vec<String>),
    /// The session was rejected; the caller must refresh it.
    Unauthorized,
    /// Network, status or parse failure.
    Failed(String),
}

/// Looks up the phone numbers of one ad.
#[async_trait]
pub trait PhoneApi: Send + Sync {
    async fn lookup(&self, ad_id: &str, session: &Session) -> PhoneLookup;
}

#[derive(Debug, Deserialize)]
struct PhoneResponse {
    data: PhoneData,
}

#[derive(Debug, Deserialize)]
struct PhoneData {
    attributes: PhoneAttributes,
}

#[derive(Debug, Deserialize)]
struct PhoneAttributes {
    #[serde(default)]
    numbers: Vec<PhoneNumber>,
}

#[derive(Debug, Deserialize)]
struct PhoneNumber {
    #[serde(rename = "formattedNumber")]
    formatted_number: Option<String>,
}

/// Formatted numbers from a phone API response body.
pub fn parse_phone_response(body: &str) -> Result<Vec<String>, serde_json::Error> {
    let parsed: PhoneResponse = serde_json::from_str(body)?;
    Ok(parsed
        .data
        .attributes
        .numbers
        .into_iter()
        .filter_map(|n| n.formatted_number)
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect())
}

/// Phone API over a [`Transport`], always on the local connection.
pub struct HttpPhoneApi {
    transport: Arc<dyn Transport>,
    base_url: String,
}

impl HttpPhoneApi {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            base_url: PHONE_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl PhoneApi for HttpPhoneApi {
    async fn lookup(&self, ad_id: &str, session: &Session) -> PhoneLookup {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), ad_id);
        let headers = [
            (
                "accept".to_string(),
                "application/json, text/plain, */*".to_string(),
            ),
            (
                "referer".to_string(),
                format!("https://www.njuskalo.hr/nekretnine/*-oglas-{}", ad_id),
            ),
        ];
        let request = PageRequest {
            authorize: true,
            headers: &headers,
            ..PageRequest::direct(&url).with_session(Some(session))
        };

        let response = match self.transport.get(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Phone lookup for ad {} failed: {}", ad_id, e);
                return PhoneLookup::Failed(e.to_string());
            }
        };
        if response.is_unauthorized() {
            debug!("Phone lookup for ad {} was unauthorized", ad_id);
            return PhoneLookup::Unauthorized;
        }
        if !response.is_success() {
            warn!(
                "Phone lookup for ad {} returned HTTP {}: {}",
                ad_id,
                response.status.as_u16(),
                response.snippet(200)
            );
            return PhoneLookup::Failed(format!("HTTP {}", response.status.as_u16()));
        }

        match parse_phone_response(&response.body) {
            Ok(numbers) => PhoneLookup::Numbers(numbers),
            Err(e) => {
                warn!(
                    "Unparseable phone response for ad {}: {} ({})",
                    ad_id,
                    e,
                    snippet(&response.body, 200)
                );
                PhoneLookup::Failed(format!("parse error: {}", e))
            }
        }
    }
}
