//! Hosted-function enrichment engine.
//!
//! POSTs the [`EngineRequest`] as JSON to `{base_url}/functions/v1/{name}`
//! with a bearer service key and reads back an [`EngineResponse`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use dealflow_queue::{EngineRequest, EngineResponse, EnrichmentEngine};
use dealflow_shared::{AppConfig, DealflowError, Result, validate_service_key};

const USER_AGENT: &str = concat!("Dealflow/", env!("CARGO_PKG_VERSION"));

pub struct HttpEngine {
    name: String,
    endpoint: Url,
    api_key: String,
    client: Client,
}

impl HttpEngine {
    pub fn new(name: &str, base_url: &Url, api_key: String, timeout: Duration) -> Result<Self> {
        let mut base = base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(&format!("functions/v1/{name}"))
            .map_err(|e| DealflowError::config(format!("invalid engine name '{name}': {e}")))?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| DealflowError::Engine(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            endpoint,
            api_key,
            client,
        })
    }

    /// One engine per configured name. Fails if the base URL or service key is missing.
    pub fn from_config(config: &AppConfig) -> Result<Vec<Arc<dyn EnrichmentEngine>>> {
        let base_url = config.engines.parsed_base_url()?;
        let api_key = validate_service_key(config)?;
        config
            .engines
            .names
            .iter()
            .map(|name| -> Result<Arc<dyn EnrichmentEngine>> {
                let engine = Self::new(name, &base_url, api_key.clone(), config.engines.timeout())?;
                Ok(Arc::new(engine) as Arc<dyn EnrichmentEngine>)
            })
            .collect()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl EnrichmentEngine for HttpEngine {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(engine = %self.name, entity = %request.entity_id))]
    async fn invoke(&self, request: &EngineRequest) -> Result<EngineResponse> {
        let response = self
            .client
            .post(self.endpoint.as_str())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| DealflowError::Engine(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DealflowError::Engine(format!("{}: failed to read body: {e}", self.endpoint)))?;

        if !status.is_success() {
            // Functions usually explain themselves in an `error` field.
            let detail = serde_json::from_str::<EngineResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| body.chars().take(200).collect());
            return Ok(EngineResponse::failed(format!("HTTP {status}: {detail}")));
        }

        let parsed: EngineResponse = serde_json::from_str(&body).map_err(|e| {
            DealflowError::Engine(format!("{}: invalid response body: {e}", self.endpoint))
        })?;
        debug!(success = parsed.success, "engine responded");
        Ok(parsed)
    }
}
