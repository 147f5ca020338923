//! Viewer orchestration
//!
//! Composes the job fetcher, artifact resolver, toolpath parser and progress
//! client into one read model for the renderer. Snapshot/toolpath loading and
//! the progress subscription run independently; each `open` starts a new
//! session and anything still running for an older session is cancelled and
//! can no longer write state.

use crate::api::{HttpJobApi, JobApi};
use crate::job::{ArtefactKind, ArtefactRef, Job, JobActions, JobId};
use crate::progress::{ProgressClient, ProgressState, ProgressTransport, SseTransport, StreamPhase};
use crate::toolpath::{self, ParseResult, Unit};
use crate::ViewerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Toolpath availability for the current job
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ToolpathState {
    /// Snapshot or artifact bytes not fetched yet
    #[default]
    Pending,
    /// The job has no toolpath artifact (yet)
    NotProduced,
    Loaded(Arc<ParseResult>),
    /// Fetching the artifact failed; holds the cause
    Failed(String),
}

impl ToolpathState {
    pub fn parsed(&self) -> Option<&ParseResult> {
        match self {
            ToolpathState::Loaded(result) => Some(result),
            _ => None,
        }
    }
}

/// Everything the renderer needs about one job
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewState {
    pub job_id: Option<JobId>,
    pub job: Option<Job>,
    pub toolpath: ToolpathState,
    pub unit: Unit,
    pub progress: f64,
    pub progress_message: String,
    pub stream: StreamPhase,
    pub actions: JobActions,
    /// Human-readable cause of the last fetch failure
    pub error: Option<String>,
    session: u64,
}

impl ViewState {
    /// Job reached success or failure
    pub fn is_settled(&self) -> bool {
        self.job.as_ref().is_some_and(|j| j.status.is_terminal())
    }
}

struct Session {
    job_id: JobId,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the view state of one viewer
pub struct ViewerOrchestrator {
    api: Arc<dyn JobApi>,
    progress: ProgressClient,
    poll_interval: Duration,
    state: Arc<watch::Sender<ViewState>>,
    session: Option<Session>,
}

impl ViewerOrchestrator {
    pub fn new(
        api: Arc<dyn JobApi>,
        transport: Arc<dyn ProgressTransport>,
        poll_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ViewState::default());
        Self {
            api,
            progress: ProgressClient::new(transport),
            poll_interval,
            state: Arc::new(state),
            session: None,
        }
    }

    /// Orchestrator talking to the configured HTTP backend
    pub fn from_config(config: &ViewerConfig) -> Self {
        Self::new(
            Arc::new(HttpJobApi::from_config(config)),
            Arc::new(SseTransport::new(&config.api_base_url)),
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    pub fn state(&self) -> ViewState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every view change
    pub fn watch(&self) -> watch::Receiver<ViewState> {
        self.state.subscribe()
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.session.as_ref().map(|s| s.job_id)
    }

    /// Start viewing `job_id`, abandoning whatever was open before
    pub fn open(&mut self, job_id: JobId) {
        self.cancel_session();

        let mut session = 0;
        self.state.send_modify(|s| {
            let next = s.session + 1;
            *s = ViewState {
                job_id: Some(job_id),
                stream: StreamPhase::Connecting,
                session: next,
                ..ViewState::default()
            };
            session = next;
        });

        info!(job_id, session, "Opening job view");

        let cancel = CancellationToken::new();
        let snapshot_task = tokio::spawn(track_job(
            Arc::clone(&self.api),
            job_id,
            session,
            Arc::clone(&self.state),
            self.poll_interval,
            cancel.clone(),
        ));

        self.progress.subscribe(job_id);
        let progress_task = tokio::spawn(forward_progress(
            self.progress.watch(),
            job_id,
            session,
            Arc::clone(&self.state),
            cancel.clone(),
        ));

        self.session = Some(Session {
            job_id,
            cancel,
            tasks: vec![snapshot_task, progress_task],
        });
    }

    /// Re-open the progress stream after a disconnect
    pub fn retry_stream(&mut self) {
        if self.session.is_some() {
            self.progress.resubscribe();
        }
    }

    /// Tear the view down; no fetch or stream outlives this call
    pub fn close(&mut self) {
        if let Some(job_id) = self.job_id() {
            info!(job_id, "Closing job view");
        }
        self.cancel_session();
        self.progress.unsubscribe();
        self.state.send_modify(|s| {
            s.session += 1;
            s.stream = StreamPhase::Terminal;
        });
    }

    fn cancel_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(job_id = session.job_id, "Cancelling session tasks");
            session.cancel.cancel();
            for task in session.tasks {
                task.abort();
            }
        }
    }
}

impl Drop for ViewerOrchestrator {
    fn drop(&mut self) {
        self.cancel_session();
    }
}

/// Apply `f` if `session` is still current. Returns whether it applied.
fn apply_current<F>(state: &watch::Sender<ViewState>, session: u64, f: F) -> bool
where
    F: FnOnce(&mut ViewState),
{
    state.send_if_modified(|s| {
        if s.session != session {
            return false;
        }
        f(s);
        true
    })
}

/// Fetch the snapshot, load the toolpath once available, and keep polling
/// until the job is terminal.
async fn track_job(
    api: Arc<dyn JobApi>,
    job_id: JobId,
    session: u64,
    state: Arc<watch::Sender<ViewState>>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut toolpath_loaded = false;

    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            fetched = api.fetch_job(job_id) => fetched,
        };

        match fetched {
            Ok(job) => {
                let terminal = job.status.is_terminal();
                let status = job.status;
                let artefact = job.resolve(ArtefactKind::ToolpathText).cloned();

                let applied = apply_current(&state, session, |s| {
                    s.actions = job.permitted_actions();
                    s.error = None;
                    if artefact.is_none() {
                        s.toolpath = ToolpathState::NotProduced;
                    }
                    s.job = Some(job);
                });
                if !applied {
                    debug!(job_id, "Discarding snapshot for stale session");
                    return;
                }
                debug!(job_id, status = %status, "Applied job snapshot");

                if let (Some(artefact), false) = (artefact, toolpath_loaded) {
                    toolpath_loaded =
                        load_toolpath(api.as_ref(), job_id, &artefact, session, &state, &cancel)
                            .await;
                }

                if terminal {
                    info!(job_id, status = %status, "Job finished, polling stopped");
                    return;
                }
            }
            Err(e) => {
                warn!(job_id, error = %e, "Job snapshot fetch failed");
                let message = e.to_string();
                apply_current(&state, session, |s| s.error = Some(message));
                if e.is_not_found() {
                    return;
                }
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Fetch and parse the toolpath text. Returns true once it is loaded.
async fn load_toolpath(
    api: &dyn JobApi,
    job_id: JobId,
    artefact: &ArtefactRef,
    session: u64,
    state: &watch::Sender<ViewState>,
    cancel: &CancellationToken,
) -> bool {
    let fetched = tokio::select! {
        biased;
        _ = cancel.cancelled() => return false,
        fetched = api.fetch_text(artefact) => fetched,
    };

    match fetched {
        Ok(text) => {
            let parsed = Arc::new(toolpath::parse(&text));
            info!(
                job_id,
                polylines = parsed.polylines.len(),
                unit = %parsed.unit,
                "Toolpath loaded"
            );
            apply_current(state, session, |s| {
                s.unit = parsed.unit;
                s.toolpath = ToolpathState::Loaded(parsed);
            })
        }
        Err(e) => {
            warn!(job_id, error = %e, "Toolpath fetch failed");
            let message = e.to_string();
            apply_current(state, session, |s| {
                s.toolpath = ToolpathState::Failed(message.clone());
                s.error = Some(message);
            });
            false
        }
    }
}

/// Mirror progress-client state into the view while the session lasts
async fn forward_progress(
    mut progress: watch::Receiver<ProgressState>,
    job_id: JobId,
    session: u64,
    state: Arc<watch::Sender<ViewState>>,
    cancel: CancellationToken,
) {
    loop {
        let current = progress.borrow_and_update().clone();
        if current.job_id == Some(job_id) {
            let applied = apply_current(&state, session, |s| {
                s.progress = current.progress;
                s.progress_message = current.message.clone();
                s.stream = current.phase;
            });
            if !applied {
                return;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            changed = progress.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
