//! HTTP client for the Solr cores that hold the published catalog.

use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use catalogsync_shared::{CatalogError, CollectionType, CoreNames, Result, SolrConfig};

use crate::search::{
    GeoRadius, SearchQuery, SearchResults, SuggestField, SuggestQuery, Suggestions,
};
use crate::{IndexTransport, SinkRequest, SinkResponse};

/// User-Agent string for index requests.
const USER_AGENT: &str = concat!("catalogsync/", env!("CARGO_PKG_VERSION"));

/// Outcome of optimizing every core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub optimized: Vec<String>,
    /// Cores still failing after the last attempt.
    pub failed: Vec<String>,
    pub attempts: u32,
}

/// Thin client over the Solr update, select and optimize endpoints.
#[derive(Debug, Clone)]
pub struct SolrClient {
    client: Client,
    base_url: Url,
    cores: CoreNames,
}

impl SolrClient {
    pub fn new(config: &SolrConfig) -> Result<Self> {
        // `Url::join` replaces the last path segment unless the base ends with '/'.
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| CatalogError::config(format!("invalid solr base_url '{base}': {e}")))?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CatalogError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            cores: config.cores.clone(),
        })
    }

    pub fn core_for(&self, collection: CollectionType) -> &str {
        self.cores.for_collection(collection)
    }

    fn core_url(&self, core: &str, path: &str) -> Result<Url> {
        self.base_url
            .join(&format!("{core}/{path}"))
            .map_err(|e| CatalogError::config(format!("invalid core '{core}': {e}")))
    }

    /// Run a search against the core for `collection`.
    #[instrument(skip_all, fields(collection = %collection, text = %query.text))]
    pub async fn search(
        &self,
        collection: CollectionType,
        query: &SearchQuery,
        vector: Option<&[f32]>,
    ) -> Result<SearchResults> {
        let params = query.to_params(vector)?;

        #[derive(serde::Deserialize)]
        struct Envelope {
            response: SearchResults,
        }

        let envelope: Envelope = self.select(collection, &params).await?;
        debug!(num_found = envelope.response.num_found, "search completed");
        Ok(envelope.response)
    }

    /// Type-ahead suggestions from the core for `collection`.
    #[instrument(skip_all, fields(collection = %collection, text = %query.text, field = ?query.field))]
    pub async fn suggest(
        &self,
        collection: CollectionType,
        query: &SuggestQuery,
    ) -> Result<Suggestions> {
        let params = query.to_params()?;
        let body: serde_json::Value = self.select(collection, &params).await?;
        let suggestions = Suggestions::from_response(query.field, &body);
        debug!(
            matches = suggestions.matches,
            groups = suggestions.docs.len(),
            "suggest completed"
        );
        Ok(suggestions)
    }

    /// Item and provider suggestions for the same text, fetched concurrently.
    pub async fn suggest_names(
        &self,
        collection: CollectionType,
        text: &str,
        geo: Option<GeoRadius>,
    ) -> Result<(Suggestions, Suggestions)> {
        let item = SuggestQuery {
            geo,
            ..SuggestQuery::new(text, SuggestField::ItemName)
        };
        let provider = SuggestQuery {
            geo,
            ..SuggestQuery::new(text, SuggestField::ProviderName)
        };
        tokio::try_join!(
            self.suggest(collection, &item),
            self.suggest(collection, &provider)
        )
    }

    /// POST `params` as a form to the core's select handler.
    async fn select<R>(&self, collection: CollectionType, params: &[(String, String)]) -> Result<R>
    where
        R: serde::de::DeserializeOwned,
    {
        let url = self.core_url(self.core_for(collection), "select")?;

        let response = self
            .client
            .post(url.clone())
            .form(params)
            .send()
            .await
            .map_err(|e| CatalogError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Network(format!(
                "{url}: HTTP {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| CatalogError::Serialization(format!("{url}: {e}")))
    }

    /// Merge one core down to a single segment.
    async fn optimize_core(&self, core: &str) -> Result<()> {
        let mut url = self.core_url(core, "update")?;
        url.query_pairs_mut()
            .append_pair("optimize", "true")
            .append_pair("maxSegments", "1");

        // Optimization can run far longer than a bulk update.
        let response = self
            .client
            .get(url.clone())
            .timeout(Duration::from_secs(60 * 60))
            .send()
            .await
            .map_err(|e| CatalogError::Network(format!("{url}: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CatalogError::Network(format!(
                "{url}: HTTP {}",
                response.status()
            )))
        }
    }

    /// Optimize every configured core concurrently, retrying only the cores
    /// that failed, up to `max_attempts` rounds.
    #[instrument(skip_all)]
    pub async fn optimize_all(
        &self,
        max_attempts: u32,
        retry_delay: Duration,
        cancel: &CancellationToken,
    ) -> OptimizeReport {
        let mut remaining: Vec<String> = self.cores.all().into_iter().map(String::from).collect();
        let mut report = OptimizeReport::default();

        while !remaining.is_empty() && report.attempts < max_attempts.max(1) {
            report.attempts += 1;
            info!(attempt = report.attempts, cores = ?remaining, "optimizing cores");

            let mut handles = Vec::with_capacity(remaining.len());
            for core in remaining.drain(..) {
                let this = self.clone();
                handles.push(tokio::spawn(async move {
                    let result = this.optimize_core(&core).await;
                    (core, result)
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok((core, Ok(()))) => {
                        info!(%core, "core optimized");
                        report.optimized.push(core);
                    }
                    Ok((core, Err(e))) => {
                        warn!(%core, error = %e, "core optimization failed");
                        remaining.push(core);
                    }
                    Err(e) => warn!(error = %e, "optimize task failed"),
                }
            }

            if !remaining.is_empty() && report.attempts < max_attempts {
                warn!(delay_secs = retry_delay.as_secs(), "retrying failed cores");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }

        report.failed = remaining;
        report
    }
}

impl IndexTransport for SolrClient {
    fn name(&self) -> &str {
        "solr"
    }

    async fn send(&self, req: &SinkRequest) -> Result<SinkResponse> {
        let url = self.core_url(&req.core, "update/json/docs")?;

        let response = self
            .client
            .post(url.clone())
            .json(&req.docs)
            .send()
            .await
            .map_err(|e| CatalogError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(CatalogError::Network(format!(
                "{url}: HTTP {status}: {body}"
            )));
        }

        debug!(core = %req.core, docs = req.docs.len(), "bulk update accepted");
        Ok(SinkResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchFilter;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> SolrClient {
        let config = SolrConfig {
            // No trailing slash on purpose.
            base_url: format!("{}/solr", server.uri()),
            ..SolrConfig::default()
        };
        SolrClient::new(&config).unwrap()
    }

    fn request(core: &str) -> SinkRequest {
        SinkRequest {
            core: core.into(),
            docs: vec![],
        }
    }

    #[tokio::test]
    async fn posts_bulk_update_to_core() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/solr/grocery/update/json/docs"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"responseHeader":{"status":0}}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let response = client.send(&request("grocery")).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.contains("responseHeader"));
    }

    #[tokio::test]
    async fn server_error_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = client_for(&server).send(&request("fnb")).await.unwrap_err();
        assert!(matches!(err, CatalogError::Network(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn search_posts_form_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/solr/electronics/select"))
            .and(body_string_contains("fq=provider_status%3Aenable"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": {"numFound": 1, "start": 0, "docs": [{"id": "a"}]}
            })))
            .mount(&server)
            .await;

        let mut query = SearchQuery::new("laptop");
        query.filters = vec![SearchFilter::ProviderStatus("enable".into())];

        let results = client_for(&server)
            .search(CollectionType::Electronics, &query, None)
            .await
            .unwrap();
        assert_eq!(results.num_found, 1);
        assert_eq!(results.docs[0]["id"], "a");
    }

    #[tokio::test]
    async fn suggest_names_queries_both_fields() {
        let server = MockServer::start().await;
        for (field, id) in [("item_name_suggest", "item-1"), ("provider_name_suggest", "prov-1")] {
            Mock::given(method("POST"))
                .and(path("/solr/grocery/select"))
                .and(body_string_contains(format!("group.field={field}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "grouped": {field: {"matches": 1, "groups": [
                        {"doclist": {"docs": [{"id": id, "suggest": "Mango", "text": "Mango"}]}}
                    ]}},
                    "highlighting": {id: {field: ["<b>Man</b>go"]}}
                })))
                .expect(1)
                .mount(&server)
                .await;
        }

        let (items, providers) = client_for(&server)
            .suggest_names(CollectionType::Grocery, "man", None)
            .await
            .unwrap();
        assert_eq!(items.docs[0].id, "item-1");
        assert_eq!(items.docs[0].suggest, "<b>Man</b>go");
        assert_eq!(providers.docs[0].id, "prov-1");
    }

    #[tokio::test]
    async fn optimize_retries_only_failed_cores() {
        let server = MockServer::start().await;
        for core in ["grocery", "fnb"] {
            Mock::given(method("GET"))
                .and(path(format!("/solr/{core}/update")))
                .and(query_param("optimize", "true"))
                .and(query_param("maxSegments", "1"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/solr/electronics/update"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let report = client_for(&server)
            .optimize_all(2, Duration::from_millis(10), &CancellationToken::new())
            .await;
        assert_eq!(report.attempts, 2);
        assert_eq!(report.optimized.len(), 2);
        assert_eq!(report.failed, vec!["electronics".to_string()]);
    }
}
