//! Live progress stream client
//!
//! One subscription per client, keyed by job id. The latest decoded event
//! wins; nothing is buffered. Each subscription gets a fresh generation
//! number and the reader task only writes state while its generation is
//! current, so events arriving after teardown are dropped.
//!
//! The open stream is parked in a slot shared with the reader task, so
//! teardown drops it (closing the connection) before returning.
//!
//! Phases:
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Idle | subscribe | Connecting |
//! | Connecting | transport opened | Live |
//! | Live | decodable message | Live (value updated) |
//! | Live | undecodable message | Live (value unchanged) |
//! | Connecting, Live | transport error or end of stream | Disconnected |
//! | any | unsubscribe | Terminal |
//!
//! Reconnecting is left to the caller (`resubscribe`).

mod sse;

pub use sse::SseTransport;

use crate::job::JobId;
use async_trait::async_trait;
use futures::future::poll_fn;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from the progress transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Failed to open progress stream: {0}")]
    Open(String),

    #[error("Progress stream rejected with HTTP {0}")]
    Status(u16),

    #[error("Progress stream failed: {0}")]
    Stream(String),
}

/// Raw message payloads, in receipt order
pub type MessageStream = BoxStream<'static, Result<String, TransportError>>;

/// Opens server-push channels addressed by job id.
///
/// Dropping the returned stream closes the underlying connection.
#[async_trait]
pub trait ProgressTransport: Send + Sync {
    async fn open(&self, job_id: JobId) -> Result<MessageStream, TransportError>;
}

/// One pushed progress message
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ProgressEvent {
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
}

impl ProgressEvent {
    /// Decode a JSON payload; anything that is not a matching object is `None`
    pub fn decode(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }

    /// Human-readable label, `message` taking precedence over `stage`
    pub fn label(&self) -> Option<&str> {
        self.message
            .as_deref()
            .filter(|m| !m.is_empty())
            .or_else(|| self.stage.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Connection phase of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Connecting,
    Live,
    Disconnected,
    Terminal,
}

impl std::fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamPhase::Idle => write!(f, "idle"),
            StreamPhase::Connecting => write!(f, "connecting"),
            StreamPhase::Live => write!(f, "live"),
            StreamPhase::Disconnected => write!(f, "disconnected"),
            StreamPhase::Terminal => write!(f, "terminal"),
        }
    }
}

/// Latest known progress of the subscribed job
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressState {
    pub job_id: Option<JobId>,
    pub phase: StreamPhase,
    /// Conventionally 0..=100
    pub progress: f64,
    pub message: String,
    generation: u64,
}

impl ProgressState {
    /// Between start and completion, i.e. worth showing a progress bar
    pub fn is_active(&self) -> bool {
        self.progress > 0.0 && self.progress < 100.0
    }

    /// Progress as a fraction clamped to [0, 1]
    pub fn fraction(&self) -> f64 {
        (self.progress / 100.0).clamp(0.0, 1.0)
    }

    fn apply_event(&mut self, event: &ProgressEvent) {
        if let Some(progress) = event.progress {
            self.progress = progress;
        }
        if let Some(label) = event.label() {
            self.message = label.to_string();
        }
    }
}

/// Open stream of one subscription; `None` once closed
type StreamSlot = Arc<Mutex<Option<MessageStream>>>;

struct Subscription {
    job_id: JobId,
    cancel: CancellationToken,
    stream: StreamSlot,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop the reader and close the transport before returning
    fn close(self) {
        self.cancel.cancel();
        self.task.abort();
        drop(take_stream(&self.stream));
    }
}

/// Client holding at most one live progress subscription
pub struct ProgressClient {
    transport: Arc<dyn ProgressTransport>,
    state: Arc<watch::Sender<ProgressState>>,
    active: Option<Subscription>,
    last_job: Option<JobId>,
}

impl ProgressClient {
    pub fn new(transport: Arc<dyn ProgressTransport>) -> Self {
        let (state, _) = watch::channel(ProgressState::default());
        Self {
            transport,
            state: Arc::new(state),
            active: None,
            last_job: None,
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ProgressState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<ProgressState> {
        self.state.subscribe()
    }

    /// Start streaming progress for `job_id`.
    ///
    /// Any previous subscription is torn down first. Subscribing again to the
    /// job that is already connecting or live is a no-op. Re-subscribing to
    /// the same job keeps the last known progress until a new event arrives.
    pub fn subscribe(&mut self, job_id: JobId) {
        if let Some(active) = &self.active {
            let phase = self.state.borrow().phase;
            if active.job_id == job_id
                && matches!(phase, StreamPhase::Connecting | StreamPhase::Live)
            {
                return;
            }
        }

        self.teardown();

        let mut generation = 0;
        self.state.send_modify(|s| {
            s.generation += 1;
            if s.job_id != Some(job_id) {
                s.job_id = Some(job_id);
                s.progress = 0.0;
                s.message.clear();
            }
            s.phase = StreamPhase::Connecting;
            generation = s.generation;
        });

        debug!(job_id, generation, "Subscribing to progress stream");

        let cancel = CancellationToken::new();
        let stream: StreamSlot = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.transport),
            job_id,
            generation,
            Arc::clone(&self.state),
            Arc::clone(&stream),
            cancel.clone(),
        ));

        self.active = Some(Subscription {
            job_id,
            cancel,
            stream,
            task,
        });
        self.last_job = Some(job_id);
    }

    /// Re-open the stream for the last subscribed job (manual retry)
    pub fn resubscribe(&mut self) -> bool {
        match self.last_job {
            Some(job_id) => {
                self.subscribe(job_id);
                true
            }
            None => false,
        }
    }

    /// Close the transport and stop applying events
    pub fn unsubscribe(&mut self) {
        self.teardown();
        self.state.send_modify(|s| {
            s.generation += 1;
            s.phase = StreamPhase::Terminal;
        });
    }

    fn teardown(&mut self) {
        if let Some(sub) = self.active.take() {
            debug!(job_id = sub.job_id, "Closing progress stream");
            sub.close();
        }
    }
}

impl Drop for ProgressClient {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Apply `f` if `generation` is still current. Returns whether it applied.
fn apply_current<F>(state: &watch::Sender<ProgressState>, generation: u64, f: F) -> bool
where
    F: FnOnce(&mut ProgressState),
{
    state.send_if_modified(|s| {
        if s.generation != generation {
            return false;
        }
        f(s);
        true
    })
}

fn lock_slot(slot: &StreamSlot) -> std::sync::MutexGuard<'_, Option<MessageStream>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_stream(slot: &StreamSlot) -> Option<MessageStream> {
    lock_slot(slot).take()
}

/// Park a freshly opened stream unless the subscription was torn down
/// meanwhile, in which case it is dropped here.
fn park_stream(slot: &StreamSlot, cancel: &CancellationToken, stream: MessageStream) -> bool {
    let mut guard = lock_slot(slot);
    if cancel.is_cancelled() {
        return false;
    }
    *guard = Some(stream);
    true
}

/// Next message from the parked stream; outer `None` once it was taken
fn poll_slot(
    slot: &StreamSlot,
    cx: &mut Context<'_>,
) -> Poll<Option<Option<Result<String, TransportError>>>> {
    match lock_slot(slot).as_mut() {
        Some(stream) => stream.poll_next_unpin(cx).map(Some),
        None => Poll::Ready(None),
    }
}

async fn run_subscription(
    transport: Arc<dyn ProgressTransport>,
    job_id: JobId,
    generation: u64,
    state: Arc<watch::Sender<ProgressState>>,
    slot: StreamSlot,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        opened = transport.open(job_id) => opened,
    };

    match opened {
        Ok(stream) => {
            if !park_stream(&slot, &cancel, stream) {
                debug!(job_id, "Dropping stream opened after teardown");
                return;
            }
        }
        Err(e) => {
            warn!(job_id, error = %e, "Progress stream failed to open");
            apply_current(&state, generation, |s| s.phase = StreamPhase::Disconnected);
            return;
        }
    }

    if apply_current(&state, generation, |s| s.phase = StreamPhase::Live) {
        info!(job_id, "Progress stream live");
        read_stream(job_id, generation, &state, &slot, &cancel).await;
    }

    drop(take_stream(&slot));
}

async fn read_stream(
    job_id: JobId,
    generation: u64,
    state: &watch::Sender<ProgressState>,
    slot: &StreamSlot,
    cancel: &CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = poll_fn(|cx| poll_slot(slot, cx)) => next,
        };

        let Some(next) = next else {
            break;
        };

        match next {
            Some(Ok(payload)) => match ProgressEvent::decode(&payload) {
                Some(event) => {
                    if !apply_current(state, generation, |s| s.apply_event(&event)) {
                        debug!(job_id, "Discarding progress event for stale subscription");
                        break;
                    }
                }
                None => debug!(job_id, payload = %payload, "Ignoring undecodable progress message"),
            },
            Some(Err(e)) => {
                warn!(job_id, error = %e, "Progress stream disconnected");
                apply_current(state, generation, |s| s.phase = StreamPhase::Disconnected);
                break;
            }
            None => {
                info!(job_id, "Progress stream closed by server");
                apply_current(state, generation, |s| s.phase = StreamPhase::Disconnected);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, FakeTransport};
    use std::time::Duration;

    async fn wait_phase(client: &ProgressClient, phase: StreamPhase) -> ProgressState {
        let mut rx = client.watch();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.phase == phase))
            .await
            .expect("timed out waiting for phase")
            .expect("state channel closed")
            .clone();
        state
    }

    #[test]
    fn test_event_label_precedence() {
        let ev = ProgressEvent::decode(r#"{"progress": 10, "message": "m", "stage": "s"}"#).unwrap();
        assert_eq!(ev.label(), Some("m"));
        let ev = ProgressEvent::decode(r#"{"stage": "meshing"}"#).unwrap();
        assert_eq!(ev.label(), Some("meshing"));
        let ev = ProgressEvent::decode(r#"{"message": "", "stage": "s"}"#).unwrap();
        assert_eq!(ev.label(), Some("s"));
        let ev = ProgressEvent::decode(r#"{"progress": 5}"#).unwrap();
        assert_eq!(ev.label(), None);
    }

    #[test]
    fn test_event_decode_rejects_garbage() {
        assert!(ProgressEvent::decode("not json").is_none());
        assert!(ProgressEvent::decode("42").is_none());
        assert!(ProgressEvent::decode(r#"{"progress": "high"}"#).is_none());
    }

    #[test]
    fn test_state_helpers() {
        let mut state = ProgressState::default();
        assert!(!state.is_active());
        state.progress = 42.0;
        assert!(state.is_active());
        assert!((state.fraction() - 0.42).abs() < 1e-9);
        state.progress = 140.0;
        assert!(!state.is_active());
        assert_eq!(state.fraction(), 1.0);
    }

    #[tokio::test]
    async fn test_progress_updates_latest_value() {
        let transport = Arc::new(FakeTransport::new());
        let mut client = ProgressClient::new(transport.clone());
        assert_eq!(client.state().phase, StreamPhase::Idle);

        client.subscribe(99);
        wait_phase(&client, StreamPhase::Live).await;

        let mut rx = client.watch();
        transport.push(99, r#"{"progress": 42, "message": "ileri"}"#);
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.progress == 42.0))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(state.message, "ileri");
        assert_eq!(state.job_id, Some(99));
    }

    #[tokio::test]
    async fn test_undecodable_message_leaves_state_unchanged() {
        let transport = Arc::new(FakeTransport::new());
        let mut client = ProgressClient::new(transport.clone());
        client.subscribe(1);
        wait_phase(&client, StreamPhase::Live).await;

        transport.push(1, r#"{"progress": 30, "stage": "roughing"}"#);
        transport.push(1, "{garbage");
        transport.push(1, r#"{"progress": 35}"#);

        let mut rx = client.watch();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.progress == 35.0))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(state.message, "roughing");
        assert_eq!(state.phase, StreamPhase::Live);
    }

    #[tokio::test]
    async fn test_transport_error_marks_disconnected() {
        let transport = Arc::new(FakeTransport::new());
        let mut client = ProgressClient::new(transport.clone());
        client.subscribe(1);
        wait_phase(&client, StreamPhase::Live).await;

        transport.push(1, r#"{"progress": 50}"#);
        transport.fail(1, "connection reset");
        let state = wait_phase(&client, StreamPhase::Disconnected).await;
        assert_eq!(state.progress, 50.0);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_marks_disconnected() {
        let transport = Arc::new(FakeTransport::new());
        transport.refuse_opens(true);
        let mut client = ProgressClient::new(transport.clone());
        client.subscribe(1);
        wait_phase(&client, StreamPhase::Disconnected).await;
    }

    #[tokio::test]
    async fn test_server_close_marks_disconnected() {
        let transport = Arc::new(FakeTransport::new());
        let mut client = ProgressClient::new(transport.clone());
        client.subscribe(1);
        wait_phase(&client, StreamPhase::Live).await;

        transport.hang_up(1);
        wait_phase(&client, StreamPhase::Disconnected).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_transport_once() {
        let transport = Arc::new(FakeTransport::new());
        let mut client = ProgressClient::new(transport.clone());
        client.subscribe(1);
        wait_phase(&client, StreamPhase::Live).await;
        transport.push(1, r#"{"progress": 10}"#);
        wait_until(|| client.state().progress == 10.0).await;

        client.unsubscribe();
        assert_eq!(transport.closes(), 1);
        assert_eq!(client.state().phase, StreamPhase::Terminal);

        // Late event after teardown is never applied
        transport.push(1, r#"{"progress": 80}"#);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.state().progress, 10.0);
        assert_eq!(client.state().phase, StreamPhase::Terminal);

        client.unsubscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.closes(), 1);
    }

    #[tokio::test]
    async fn test_switching_job_tears_down_previous() {
        let transport = Arc::new(FakeTransport::new());
        let mut client = ProgressClient::new(transport.clone());
        client.subscribe(1);
        wait_phase(&client, StreamPhase::Live).await;

        client.subscribe(2);
        assert_eq!(transport.closes(), 1);
        assert_eq!(client.state().job_id, Some(2));
        wait_phase(&client, StreamPhase::Live).await;

        transport.push(1, r#"{"progress": 90}"#);
        transport.push(2, r#"{"progress": 5}"#);
        wait_until(|| client.state().progress == 5.0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.state().progress, 5.0);
        assert_eq!(transport.opened_jobs(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_subscribe_same_live_job_is_noop() {
        let transport = Arc::new(FakeTransport::new());
        let mut client = ProgressClient::new(transport.clone());
        client.subscribe(3);
        wait_phase(&client, StreamPhase::Live).await;
        client.subscribe(3);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(transport.closes(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_after_disconnect() {
        let transport = Arc::new(FakeTransport::new());
        let mut client = ProgressClient::new(transport.clone());
        assert!(!client.resubscribe());

        client.subscribe(4);
        wait_phase(&client, StreamPhase::Live).await;
        transport.fail(4, "boom");
        wait_phase(&client, StreamPhase::Disconnected).await;

        assert!(client.resubscribe());
        wait_phase(&client, StreamPhase::Live).await;
        assert_eq!(transport.opened_jobs(), vec![4, 4]);
    }

    #[tokio::test]
    async fn test_drop_closes_transport() {
        let transport = Arc::new(FakeTransport::new());
        let mut client = ProgressClient::new(transport.clone());
        client.subscribe(1);
        wait_phase(&client, StreamPhase::Live).await;
        drop(client);
        assert_eq!(transport.closes(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_switching_closes_previous_before_returning() {
        let transport = Arc::new(FakeTransport::new());
        let mut client = ProgressClient::new(transport.clone());
        for round in 0..50 {
            client.subscribe(1);
            wait_phase(&client, StreamPhase::Live).await;
            client.subscribe(2);
            assert_eq!(transport.closes(), 2 * round + 1);
            wait_phase(&client, StreamPhase::Live).await;
            client.unsubscribe();
            assert_eq!(transport.closes(), 2 * round + 2);
        }
    }

    #[tokio::test]
    async fn test_resubscribe_keeps_last_progress() {
        let transport = Arc::new(FakeTransport::new());
        let mut client = ProgressClient::new(transport.clone());
        client.subscribe(4);
        wait_phase(&client, StreamPhase::Live).await;
        transport.push(4, r#"{"progress": 64, "stage": "finishing"}"#);
        wait_until(|| client.state().progress == 64.0).await;
        transport.fail(4, "reset");
        wait_phase(&client, StreamPhase::Disconnected).await;

        assert!(client.resubscribe());
        let state = client.state();
        assert_eq!(state.phase, StreamPhase::Connecting);
        assert_eq!(state.progress, 64.0);
        assert_eq!(state.message, "finishing");

        client.subscribe(5);
        assert_eq!(client.state().progress, 0.0);
        assert!(client.state().message.is_empty());
    }
}
