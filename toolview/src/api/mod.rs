//! Job snapshot and artifact fetching
//!
//! The fetcher is stateless: each call is one request. Re-fetching while a
//! job runs is the orchestrator's job.

mod http;

pub use http::HttpJobApi;

use crate::job::{ArtefactRef, Job, JobId};
use async_trait::async_trait;
use thiserror::Error;

/// Errors from fetching a job snapshot or artifact bytes
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limit exceeded (429), try again later")]
    RateLimited,

    #[error("Queue is paused (409), try again shortly")]
    QueuePaused,

    #[error("Not authorized (403)")]
    Forbidden,

    #[error("Request failed with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound(_))
    }

    /// Map a non-success HTTP status to an error
    pub fn from_status(job_id: Option<JobId>, status: u16, body: &str) -> Self {
        match (status, job_id) {
            (404, Some(id)) => FetchError::NotFound(id),
            (429, _) => FetchError::RateLimited,
            (409, _) => FetchError::QueuePaused,
            (403, _) => FetchError::Forbidden,
            _ => FetchError::Status {
                status,
                body: if body.is_empty() {
                    format!("request failed: {}", status)
                } else {
                    body.to_string()
                },
            },
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else {
            FetchError::Unavailable(e.to_string())
        }
    }
}

/// Source of job snapshots and artifact bytes
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Current snapshot of a job
    async fn fetch_job(&self, job_id: JobId) -> Result<Job, FetchError>;

    /// Raw text behind an artifact locator
    async fn fetch_text(&self, artefact: &ArtefactRef) -> Result<String, FetchError>;
}
