//! Wizard operator interface.
//!
//! During an install the bootstrap wizard owns operation state before the
//! cluster itself exists. Plan commands reach it over HTTPS with the
//! installer-provided bearer token.

use async_trait::async_trait;
use slog::{debug, warn, Logger};

use crate::defaults;
use crate::error::{Error, Result};
use crate::ops::{Operation, Site, SiteKey};

/// Read access to cluster and operation state held by the wizard.
#[async_trait]
pub trait Operator: Send + Sync {
    /// All clusters registered under the account.
    async fn get_sites(&self, account_id: &str) -> Result<Vec<Site>>;

    /// The most recently created operation for the cluster.
    async fn get_last_operation(&self, key: &SiteKey) -> Result<Operation>;
}

/// HTTP client for the wizard operator endpoint.
pub struct HttpOperator {
    client: reqwest::Client,
    base_url: String,
    token: String,
    logger: Logger,
}

impl HttpOperator {
    /// Creates a client for the operator at base_url authenticating with the
    /// bearer token.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, logger: Logger) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(defaults::OPERATOR_TIMEOUT)
            .build()
            .map_err(|err| Error::Other(format!("failed to create HTTP client: {}", err)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            logger,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        debug!(self.logger, "Querying operator."; "url" => &url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| {
                warn!(self.logger, "Operator request failed."; "url" => &url, "error" => %err);
                Error::Other(format!("operator request failed: {}", err))
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{} not found", url)));
        }
        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "operator returned status {} for {}",
                response.status(),
                url
            )));
        }

        response
            .json()
            .await
            .map_err(|err| Error::Other(format!("failed to decode operator response: {}", err)))
    }
}

#[async_trait]
impl Operator for HttpOperator {
    async fn get_sites(&self, account_id: &str) -> Result<Vec<Site>> {
        self.get(format!("{}/portal/v1/accounts/{}/sites", self.base_url, account_id))
            .await
    }

    async fn get_last_operation(&self, key: &SiteKey) -> Result<Operation> {
        self.get(format!(
            "{}/portal/v1/accounts/{}/sites/{}/operations/last",
            self.base_url, key.account_id, key.site_domain
        ))
        .await
    }
}
