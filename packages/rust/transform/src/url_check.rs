//! Liveness check for media URLs referenced by product records.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;
use url::Url;

use catalogsync_shared::{CatalogError, Result};

/// User-Agent string for liveness checks.
const USER_AGENT: &str = concat!("catalogsync/", env!("CARGO_PKG_VERSION"));

/// Issues HEAD requests and reports whether a URL resolves to a non-error status.
#[derive(Debug, Clone)]
pub struct UrlChecker {
    client: Client,
}

impl UrlChecker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// `true` when a HEAD request (following redirects) answers with a status below 400.
    /// Malformed URLs, timeouts and connection errors count as unreachable.
    pub async fn is_reachable(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            debug!(url, "unparseable URL");
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }

        match self.client.head(parsed).send().await {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() >= 400 {
                    debug!(url, %status, "URL check failed");
                }
                status.as_u16() < 400
            }
            Err(e) => {
                debug!(url, error = %e, "URL check request failed");
                false
            }
        }
    }
}
