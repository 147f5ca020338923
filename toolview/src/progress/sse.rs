//! Server-sent events transport for progress streams

use super::{MessageStream, ProgressTransport, TransportError};
use crate::job::JobId;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Client;
use tracing::debug;

/// Opens `GET {base}/api/v1/sim/{id}/events` and yields each event's data
pub struct SseTransport {
    client: Client,
    base_url: String,
}

impl SseTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        // No request timeout: the stream stays open for the whole job
        Self {
            client: Client::builder()
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn events_url(&self, job_id: JobId) -> String {
        format!("{}/api/v1/sim/{}/events", self.base_url, job_id)
    }
}

fn is_message(event: &str) -> bool {
    event.is_empty() || event == "message"
}

#[async_trait]
impl ProgressTransport for SseTransport {
    async fn open(&self, job_id: JobId) -> Result<MessageStream, TransportError> {
        let url = self.events_url(job_id);
        debug!(job_id, url = %url, "Opening event stream");

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        // Named events (heartbeats and the like) are not progress messages
        let events = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| {
                future::ready(match event {
                    Ok(e) if is_message(&e.event) => Some(Ok(e.data)),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Stream(e.to_string()))),
                })
            });

        Ok(events.boxed())
    }
}
