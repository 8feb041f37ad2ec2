//! Blocking HTTP adapters: backend event delivery and PDF download.
use crate::error::IoError;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use weigh_config::{BackendSection, PrintSection};
use weigh_traits::{BoxError, DocumentFetcher, EventTransport};

pub const API_KEY_HEADER: &str = "X-API-Key";

fn client(timeout: Duration) -> Result<Client, IoError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// POSTs each event body to `<base_url>/<events_endpoint>`.
#[derive(Debug, Clone)]
pub struct HttpEventTransport {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpEventTransport {
    pub fn from_section(b: &BackendSection) -> Result<Self, IoError> {
        Ok(Self {
            client: client(Duration::from_millis(b.timeout_ms))?,
            url: b.events_url(),
            api_key: (!b.api_key.is_empty()).then(|| b.api_key.clone()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Headers sent with every event.
    pub fn headers(&self) -> Result<HeaderMap, IoError> {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(key).map_err(|e| IoError::Http(format!("api key: {e}")))?;
            h.insert(HeaderName::from_static("x-api-key"), value);
        }
        Ok(h)
    }
}

impl EventTransport for HttpEventTransport {
    fn post(&mut self, body: &[u8]) -> Result<(), BoxError> {
        self.client
            .post(&self.url)
            .headers(self.headers()?)
            .body(body.to_vec())
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(IoError::from)?;
        Ok(())
    }
}

/// Downloads documents for URL print jobs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn from_section(p: &PrintSection) -> Result<Self, IoError> {
        Ok(Self {
            client: client(Duration::from_millis(p.fetch_timeout_ms))?,
        })
    }
}

impl DocumentFetcher for HttpFetcher {
    fn fetch(&self, url: &str, headers: &[(String, String)]) -> Result<Vec<u8>, BoxError> {
        let mut req = self.client.get(url);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req.send().and_then(|r| r.error_for_status()).map_err(IoError::from)?;
        let bytes = resp.bytes().map_err(IoError::from)?;
        tracing::debug!(url, len = bytes.len(), "document fetched");
        Ok(bytes.to_vec())
    }
}
