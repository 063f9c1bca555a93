//! Execution engine seam: topologies are built, submitted, and become jobs.
//!
//! The provider only needs `new_topology` and `submit` from an engine.
//! [`DirectSubmitter`] is the in-process engine: each task of a topology runs
//! on the tokio runtime and the job ends when every task has finished, a task
//! fails, or the job is cancelled.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SubmissionError;

pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A named unit of dataflow logic: a set of tasks submitted together.
pub struct Topology {
    name: String,
    tasks: Vec<(String, TaskFuture)>,
}

impl Topology {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_task<F>(&mut self, label: impl Into<String>, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tasks.push((label.into(), task.boxed()));
    }

    pub fn task_labels(&self) -> Vec<&str> {
        self.tasks.iter().map(|(label, _)| label.as_str()).collect()
    }

    pub fn into_tasks(self) -> Vec<(String, TaskFuture)> {
        self.tasks
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("name", &self.name)
            .field("tasks", &self.task_labels())
            .finish()
    }
}

/// Submission options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Overrides the topology name as the job name.
    #[serde(default)]
    pub job_name: Option<String>,
}

impl JobConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            job_name: Some(name.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Closed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Running)
    }
}

/// Handle to a submitted topology.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    id: String,
    name: String,
    state: watch::Receiver<JobState>,
    cancel: Arc<Notify>,
}

/// Engine side of a [`Job`]: reports state and observes cancellation.
pub struct JobTracker {
    state: watch::Sender<JobState>,
    cancel: Arc<Notify>,
}

impl Job {
    /// Creates a running job and the tracker the engine drives it with.
    pub fn new(name: impl Into<String>) -> (Job, JobTracker) {
        let (state_tx, state_rx) = watch::channel(JobState::Running);
        let cancel = Arc::new(Notify::new());
        let job = Job {
            inner: Arc::new(JobInner {
                id: Uuid::new_v4().to_string(),
                name: name.into(),
                state: state_rx,
                cancel: cancel.clone(),
            }),
        };
        (
            job,
            JobTracker {
                state: state_tx,
                cancel,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> JobState {
        *self.inner.state.borrow()
    }

    /// Requests cancellation; the engine aborts the job's tasks.
    pub fn cancel(&self) {
        self.inner.cancel.notify_one();
    }

    /// Waits until the job reaches a terminal state.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.inner.state.clone();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                // Tracker dropped without reporting completion.
                let last = *rx.borrow();
                return if last.is_terminal() { last } else { JobState::Failed };
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl JobTracker {
    pub fn set_state(&self, state: JobState) {
        self.state.send_replace(state);
    }

    pub async fn cancelled(&self) {
        self.cancel.notified().await;
    }
}

#[async_trait]
pub trait Submitter: Send + Sync {
    fn new_topology(&self, name: Option<&str>) -> Topology;

    /// Resolves once the job exists.
    async fn submit(&self, topology: Topology, config: JobConfig) -> Result<Job, SubmissionError>;
}

/// Runs topologies as tokio tasks in this process.
#[derive(Default)]
pub struct DirectSubmitter {
    next_topology: AtomicUsize,
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl DirectSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs that have not finished yet, ordered by name.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| a.name().cmp(b.name()));
        jobs
    }

    pub fn job(&self, name: &str) -> Option<Job> {
        self.jobs.read().get(name).cloned()
    }
}

#[async_trait]
impl Submitter for DirectSubmitter {
    fn new_topology(&self, name: Option<&str>) -> Topology {
        match name {
            Some(name) => Topology::new(name),
            None => {
                let n = self.next_topology.fetch_add(1, Ordering::Relaxed);
                Topology::new(format!("topology-{n}"))
            }
        }
    }

    async fn submit(&self, topology: Topology, config: JobConfig) -> Result<Job, SubmissionError> {
        let name = config
            .job_name
            .unwrap_or_else(|| topology.name().to_string());
        if name.trim().is_empty() {
            return Err(SubmissionError::InvalidConfig("job name must not be empty".into()));
        }
        let tasks = topology.into_tasks();
        if tasks.is_empty() {
            return Err(SubmissionError::EmptyTopology(name));
        }

        let (job, tracker) = {
            let mut guard = self.jobs.write();
            if guard.contains_key(&name) {
                return Err(SubmissionError::DuplicateJob(name));
            }
            let (job, tracker) = Job::new(name.clone());
            guard.insert(name.clone(), job.clone());
            (job, tracker)
        };

        info!(
            target: "hub.engine",
            job = %name,
            id = %job.id(),
            tasks = tasks.len(),
            "job submitted"
        );

        let mut set = JoinSet::new();
        for (label, task) in tasks {
            set.spawn(async move { (label, task.await) });
        }

        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let state = supervise(&name, set, &tracker).await;
            jobs.write().remove(&name);
            tracker.set_state(state);
            info!(target: "hub.engine", job = %name, state = ?state, "job finished");
        });

        Ok(job)
    }
}

async fn supervise(
    job: &str,
    mut set: JoinSet<(String, anyhow::Result<()>)>,
    tracker: &JobTracker,
) -> JobState {
    loop {
        tokio::select! {
            _ = tracker.cancelled() => {
                set.abort_all();
                return JobState::Cancelled;
            }
            next = set.join_next() => match next {
                None => return JobState::Closed,
                Some(Ok((label, Ok(())))) => {
                    debug!(target: "hub.engine", job, task = %label, "task finished");
                }
                Some(Ok((label, Err(err)))) => {
                    warn!(target: "hub.engine", job, task = %label, error = %err, "task failed");
                    set.abort_all();
                    return JobState::Failed;
                }
                Some(Err(err)) => {
                    warn!(target: "hub.engine", job, error = %err, "task panicked");
                    set.abort_all();
                    return JobState::Failed;
                }
            }
        }
    }
}
