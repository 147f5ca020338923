//! HTTP job API client

use super::{FetchError, JobApi};
use crate::job::{ArtefactRef, Job, JobId};
use crate::ViewerConfig;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Job API backed by the REST backend
pub struct HttpJobApi {
    client: Client,
    base_url: String,
}

impl HttpJobApi {
    /// Create a client without a request timeout
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, None)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Option<Duration>) -> Self {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Self {
            client: builder.build().expect("Failed to create HTTP client"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &ViewerConfig) -> Self {
        Self::with_timeout(
            &config.api_base_url,
            config.request_timeout_secs.map(Duration::from_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn job_url(&self, job_id: JobId) -> String {
        format!("{}/api/v1/jobs/{}", self.base_url, job_id)
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn fetch_job(&self, job_id: JobId) -> Result<Job, FetchError> {
        let url = self.job_url(job_id);
        debug!(job_id, url = %url, "Fetching job snapshot");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(job_id, status = status.as_u16(), "Job fetch failed");
            return Err(FetchError::from_status(Some(job_id), status.as_u16(), &body));
        }

        let text = response.text().await?;
        let job: Job =
            serde_json::from_str(&text).map_err(|e| FetchError::Decode(e.to_string()))?;

        debug!(job_id, status = %job.status, artefacts = job.artefacts.len(), "Got job snapshot");
        Ok(job)
    }

    async fn fetch_text(&self, artefact: &ArtefactRef) -> Result<String, FetchError> {
        debug!(kind = %artefact.kind, locator = %artefact.locator, "Fetching artifact");

        let response = self.client.get(&artefact.locator).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(kind = %artefact.kind, status = status.as_u16(), "Artifact fetch failed");
            return Err(FetchError::from_status(None, status.as_u16(), &body));
        }

        let text = response.text().await?;
        debug!(kind = %artefact.kind, bytes = text.len(), "Got artifact");
        Ok(text)
    }
}
