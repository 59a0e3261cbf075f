//! Feed transport
//!
//! Retrieval is a collaborator behind [`FeedTransport`] so the pipeline can be
//! driven by a stub in tests. [`HttpTransport`] is the production
//! implementation over `reqwest`.

use async_trait::async_trait;
use reqwest::{Client, Proxy};
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::error::{IngestError, Result};

/// Fetches the raw feed document
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Fetch the document at `url`. A non-success response is an error;
    /// no partial body is ever returned.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// HTTP(S) transport with optional per-scheme proxies
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a client from the source section of the configuration
    pub fn new(source: &SourceConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(source.timeout())
            .user_agent(source.user_agent());

        for (scheme, proxy_url) in &source.proxies {
            let proxy = match scheme.as_str() {
                "http" => Proxy::http(proxy_url.as_str()),
                "https" => Proxy::https(proxy_url.as_str()),
                "all" => Proxy::all(proxy_url.as_str()),
                other => {
                    return Err(IngestError::config(format!(
                        "Unsupported proxy scheme '{}'",
                        other
                    )))
                },
            }
            .map_err(|e| IngestError::config(format!("Invalid proxy '{}': {}", proxy_url, e)))?;

            debug!(scheme = %scheme, proxy = %proxy_url, "Using proxy");
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| IngestError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl FeedTransport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        info!(url = %url, "Fetching feed");

        let response = self.client.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(IngestError::fetch(
                Some(status.as_u16()),
                status.canonical_reason().unwrap_or("request failed"),
            ));
        }

        let bytes = response.bytes().await?;
        debug!(url = %url, bytes = bytes.len(), "Fetched feed");
        Ok(bytes.to_vec())
    }
}
