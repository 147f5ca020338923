//! Toolview - toolpath interpretation and live job progress for machining jobs
//!
//! This crate provides:
//! - A toolpath text interpreter producing renderer-agnostic polylines
//! - Job snapshot and artifact fetching against the job backend
//! - A progress stream client with explicit connection phases
//! - A viewer orchestrator composing the above into one view state

pub mod api;
pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod toolpath;

#[cfg(test)]
mod testing;

pub use api::{FetchError, HttpJobApi, JobApi};
pub use job::{ArtefactKind, ArtefactRef, Job, JobId, JobStatus};
pub use orchestrator::{ToolpathState, ViewState, ViewerOrchestrator};
pub use progress::{ProgressClient, ProgressEvent, ProgressState, StreamPhase};
pub use toolpath::{parse, MachineBounds, ParseResult, Polyline, Unit};

/// Environment variable overriding `api_base_url`
pub const ENV_API_BASE_URL: &str = "TOOLVIEW_API_BASE_URL";
/// Environment variable overriding `machine_bounds` (JSON)
pub const ENV_MACHINE_BOUNDS: &str = "TOOLVIEW_MACHINE_BOUNDS";

/// Configuration for the viewer
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct ViewerConfig {
    /// Base URL of the job backend
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Job re-fetch interval while the job is queued or running (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Request timeout for snapshot/artifact fetches; none when absent
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// Machine travel envelope used for bounds checks
    #[serde(default)]
    pub machine_bounds: MachineBounds,
}

fn default_api_base_url() -> String { "http://localhost:8000".to_string() }
fn default_poll_interval_ms() -> u64 { 3000 }

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: None,
            machine_bounds: MachineBounds::default(),
        }
    }
}

impl ViewerConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply `TOOLVIEW_*` overrides using `lookup` to read variables.
    ///
    /// Malformed bounds are ignored and the configured value kept.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_BASE_URL).filter(|u| !u.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }

        if let Some(raw) = lookup(ENV_MACHINE_BOUNDS) {
            match serde_json::from_str::<MachineBounds>(&raw) {
                Ok(bounds) => self.machine_bounds = bounds,
                Err(e) => tracing::warn!(error = %e, "Ignoring malformed {}", ENV_MACHINE_BOUNDS),
            }
        }
    }
}
