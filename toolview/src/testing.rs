//! In-process fakes for the job API and progress transport

use crate::api::{FetchError, JobApi};
use crate::job::{ArtefactKind, ArtefactRef, Job, JobId, JobKind, JobStatus};
use crate::progress::{MessageStream, ProgressTransport, TransportError};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

type Message = Result<String, TransportError>;

/// Poll `cond` until it holds, panicking after two seconds
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

/// Stream that counts its own drop as a transport close
struct TrackedStream {
    rx: mpsc::UnboundedReceiver<Message>,
    closes: Arc<AtomicUsize>,
}

impl Stream for TrackedStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Progress transport driven by the test
#[derive(Default)]
pub struct FakeTransport {
    opened: Mutex<Vec<JobId>>,
    senders: Mutex<HashMap<JobId, mpsc::UnboundedSender<Message>>>,
    closes: Arc<AtomicUsize>,
    refuse: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_opens(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Deliver a payload on the most recent stream for `job_id`
    pub fn push(&self, job_id: JobId, payload: &str) {
        self.send(job_id, Ok(payload.to_string()));
    }

    pub fn fail(&self, job_id: JobId, reason: &str) {
        self.send(job_id, Err(TransportError::Stream(reason.to_string())));
    }

    /// End the stream from the server side
    pub fn hang_up(&self, job_id: JobId) {
        self.senders.lock().unwrap().remove(&job_id);
    }

    fn send(&self, job_id: JobId, message: Message) {
        if let Some(tx) = self.senders.lock().unwrap().get(&job_id) {
            let _ = tx.send(message);
        }
    }

    pub fn opens(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn opened_jobs(&self) -> Vec<JobId> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgressTransport for FakeTransport {
    async fn open(&self, job_id: JobId) -> Result<MessageStream, TransportError> {
        self.opened.lock().unwrap().push(job_id);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Open("refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().insert(job_id, tx);
        Ok(TrackedStream {
            rx,
            closes: Arc::clone(&self.closes),
        }
        .boxed())
    }
}

/// Job API serving scripted snapshots and artifact texts
#[derive(Default)]
pub struct FakeJobApi {
    /// Snapshots returned in order; the last one repeats
    jobs: Mutex<HashMap<JobId, VecDeque<Result<Job, FetchError>>>>,
    texts: Mutex<HashMap<String, Result<String, FetchError>>>,
    /// Jobs whose fetch never completes
    stalled: Mutex<HashSet<JobId>>,
    /// Artifact fetches parked until released
    held: Mutex<HashMap<String, Arc<Notify>>>,
    job_fetches: AtomicUsize,
    text_fetches: AtomicUsize,
}

impl FakeJobApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, job_id: JobId, snapshots: Vec<Result<Job, FetchError>>) {
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id, snapshots.into_iter().collect());
    }

    pub fn serve_text(&self, locator: &str, text: Result<String, FetchError>) {
        self.texts.lock().unwrap().insert(locator.to_string(), text);
    }

    pub fn stall(&self, job_id: JobId) {
        self.stalled.lock().unwrap().insert(job_id);
    }

    /// Park fetches of `locator` until `release_text` is called
    pub fn hold_text(&self, locator: &str) {
        self.held
            .lock()
            .unwrap()
            .insert(locator.to_string(), Arc::new(Notify::new()));
    }

    pub fn release_text(&self, locator: &str) {
        if let Some(gate) = self.held.lock().unwrap().get(locator) {
            gate.notify_one();
        }
    }

    pub fn job_fetches(&self) -> usize {
        self.job_fetches.load(Ordering::SeqCst)
    }

    pub fn text_fetches(&self) -> usize {
        self.text_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobApi for FakeJobApi {
    async fn fetch_job(&self, job_id: JobId) -> Result<Job, FetchError> {
        self.job_fetches.fetch_add(1, Ordering::SeqCst);
        let stalled = self.stalled.lock().unwrap().contains(&job_id);
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut jobs = self.jobs.lock().unwrap();
        let Some(queue) = jobs.get_mut(&job_id) else {
            return Err(FetchError::NotFound(job_id));
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(Err(FetchError::NotFound(job_id)))
        } else {
            queue
                .front()
                .cloned()
                .unwrap_or(Err(FetchError::NotFound(job_id)))
        }
    }

    async fn fetch_text(&self, artefact: &ArtefactRef) -> Result<String, FetchError> {
        self.text_fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.held.lock().unwrap().get(&artefact.locator).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.texts
            .lock()
            .unwrap()
            .get(&artefact.locator)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::Status {
                status: 404,
                body: "no such object".to_string(),
            }))
    }
}

/// Job snapshot with the given artifacts
pub fn job_with(id: JobId, status: JobStatus, artefacts: &[(ArtefactKind, &str)]) -> Job {
    Job {
        id,
        kind: JobKind::ToolpathGeneration,
        status,
        created_at: "2024-05-01T10:00:00Z".to_string(),
        error_message: None,
        error_code: None,
        queue: None,
        started_at: None,
        finished_at: None,
        metrics: HashMap::new(),
        artefacts: artefacts
            .iter()
            .map(|(kind, locator)| ArtefactRef {
                kind: *kind,
                locator: locator.to_string(),
                size: None,
                hash: None,
            })
            .collect(),
    }
}
