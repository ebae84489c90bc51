//! Task runner collaborator
//!
//! The release core only needs to register handlers by name, submit named
//! tasks with JSON arguments, poll their state and purge it. [`TaskRunner`]
//! is that surface; [`LocalTaskRunner`] runs tasks on the tokio runtime with
//! a bounded worker pool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walm_core::TaskSig;

use crate::error::{Result, WalmError};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long a finished task's state stays queryable
pub const DEFAULT_STATE_RETENTION: Duration = Duration::from_secs(3600);

/// Lifecycle of a submitted task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Failure(String),
    Timeout,
}

impl TaskState {
    /// Ran to completion, successfully or not
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskState::Timeout)
    }

    /// No further transition will happen
    pub fn is_terminal(&self) -> bool {
        self.is_finished() || self.is_timeout()
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            TaskState::Failure(message) => Some(message),
            TaskState::Timeout => Some("task timed out"),
            _ => None,
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, args: JsonValue) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(JsonValue) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self, args: JsonValue) -> Result<()> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn register(&self, name: &str, handler: Arc<dyn TaskHandler>);

    /// Queue a task; unknown names are rejected
    async fn submit(&self, name: &str, args: JsonValue, timeout_sec: u64) -> Result<TaskSig>;

    /// State of a task; `NotFound` once purged or never submitted
    async fn state(&self, sig: &TaskSig) -> Result<TaskState>;

    async fn purge(&self, sig: &TaskSig) -> Result<()>;

    /// Poll until the task reaches a terminal state
    async fn wait(&self, sig: &TaskSig, timeout: Duration) -> Result<TaskState> {
        let poll = async {
            loop {
                let state = self.state(sig).await?;
                if state.is_terminal() {
                    return Ok(state);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(WalmError::Timeout(format!(
                "{}s waiting for task {} {}",
                timeout.as_secs(),
                sig.name,
                sig.uuid
            ))),
        }
    }
}

type Registry = HashMap<String, Arc<dyn TaskHandler>>;

struct TaskEntry {
    state: TaskState,
    finished_at: Option<Instant>,
}

type States = RwLock<HashMap<String, TaskEntry>>;

/// Tokio-backed runner
///
/// At most `concurrency` tasks run at once; at most `queue_limit` tasks may
/// be pending or running, further submits fail. A task's timeout counts from
/// submit, so time spent queued for a worker is included. Finished states
/// are evicted once older than the retention window.
#[derive(Clone)]
pub struct LocalTaskRunner {
    handlers: Arc<RwLock<Registry>>,
    states: Arc<States>,
    permits: Arc<Semaphore>,
    queue_limit: usize,
    retention: Duration,
}

impl LocalTaskRunner {
    pub fn new(concurrency: usize, queue_limit: usize) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            states: Arc::new(RwLock::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            queue_limit,
            retention: DEFAULT_STATE_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    async fn set_state(states: &States, uuid: &str, state: TaskState) {
        // a purged task stays purged
        if let Some(entry) = states.write().await.get_mut(uuid) {
            if state.is_terminal() {
                entry.finished_at = Some(Instant::now());
            }
            entry.state = state;
        }
    }

    /// Drop finished states past the retention window
    async fn evict_expired(&self) {
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, entry| entry.finished_at.is_none_or(|at| at.elapsed() < self.retention));
        let evicted = before - states.len();
        if evicted > 0 {
            debug!(evicted, "evicted finished task states");
        }
    }

    async fn in_flight(&self) -> usize {
        self.states
            .read()
            .await
            .values()
            .filter(|e| !e.state.is_terminal())
            .count()
    }

    /// Number of task states currently held, finished ones included
    pub async fn tracked(&self) -> usize {
        self.states.read().await.len()
    }
}

impl Default for LocalTaskRunner {
    fn default() -> Self {
        Self::new(16, 1024)
    }
}

#[async_trait]
impl TaskRunner for LocalTaskRunner {
    async fn register(&self, name: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().await.insert(name.to_string(), handler);
    }

    async fn submit(&self, name: &str, args: JsonValue, timeout_sec: u64) -> Result<TaskSig> {
        let handler = self
            .handlers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| WalmError::TaskRunner(format!("task '{}' is not registered", name)))?;

        self.evict_expired().await;
        if self.in_flight().await >= self.queue_limit {
            return Err(WalmError::TaskRunner(format!(
                "task queue is full ({} tasks in flight)",
                self.queue_limit
            )));
        }

        let sig = TaskSig {
            name: name.to_string(),
            uuid: Uuid::new_v4().to_string(),
            timeout_sec,
        };
        self.states.write().await.insert(
            sig.uuid.clone(),
            TaskEntry {
                state: TaskState::Pending,
                finished_at: None,
            },
        );
        let deadline = (timeout_sec > 0).then(|| Instant::now() + Duration::from_secs(timeout_sec));

        let states = self.states.clone();
        let permits = self.permits.clone();
        let task = sig.clone();
        tokio::spawn(async move {
            let run = async {
                let _permit = permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| WalmError::TaskRunner("task runner closed".into()))?;
                Self::set_state(&states, &task.uuid, TaskState::Running).await;
                debug!(task = %task.name, uuid = %task.uuid, "task started");
                handler.run(args).await
            };
            let outcome = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, run).await.ok(),
                None => Some(run.await),
            };

            let state = match outcome {
                Some(Ok(())) => {
                    info!(task = %task.name, uuid = %task.uuid, "task succeeded");
                    TaskState::Success
                }
                Some(Err(e)) => {
                    warn!(task = %task.name, uuid = %task.uuid, error = %e, "task failed");
                    TaskState::Failure(e.to_string())
                }
                None => {
                    warn!(task = %task.name, uuid = %task.uuid, timeout_sec = task.timeout_sec, "task timed out");
                    TaskState::Timeout
                }
            };
            Self::set_state(&states, &task.uuid, state).await;
        });

        info!(task = %sig.name, uuid = %sig.uuid, "task submitted");
        Ok(sig)
    }

    async fn state(&self, sig: &TaskSig) -> Result<TaskState> {
        self.states
            .read()
            .await
            .get(&sig.uuid)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| WalmError::not_found("Task", &sig.name, &sig.uuid))
    }

    async fn purge(&self, sig: &TaskSig) -> Result<()> {
        self.states.write().await.remove(&sig.uuid);
        Ok(())
    }
}
