// Worker pool: pulls jobs from the queue and dispatches to registered
// handlers with per-kind concurrency caps, timeouts and cooperative
// cancellation.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::domain::AgentTraceError;
use crate::queue::{Job, JobKind, JobQueue, Lease, QueueClass};

/// Handler failure classification. The pool maps this onto queue retry
/// semantics: retryable failures reschedule with backoff, permanent ones
/// dead-letter.
#[derive(Debug, Clone)]
pub enum TaskError {
    Retryable(String),
    Permanent(String),
}

impl TaskError {
    pub fn message(&self) -> &str {
        match self {
            TaskError::Retryable(msg) | TaskError::Permanent(msg) => msg,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, TaskError::Permanent(_))
    }
}

impl From<AgentTraceError> for TaskError {
    fn from(err: AgentTraceError) -> Self {
        if err.is_retryable() {
            TaskError::Retryable(err.to_string())
        } else {
            TaskError::Permanent(err.to_string())
        }
    }
}

pub type TaskResult = std::result::Result<(), TaskError>;

/// Cancellation handle passed to handlers. Fired on shutdown; handlers
/// should checkpoint quickly and return.
#[derive(Clone)]
pub struct TaskContext {
    shutdown: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when shutdown is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.shutdown.clone();
        if *rx.borrow() {
            return;
        }
        // channel closure also means the process is going down
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, job: &Job, ctx: &TaskContext) -> TaskResult;
}

/// Per-kind dispatch options declared at registration time.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub max_concurrency: usize,
    pub timeout: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            timeout: Duration::from_secs(300),
        }
    }
}

struct Registered {
    handler: Arc<dyn TaskHandler>,
    options: HandlerOptions,
    semaphore: Arc<Semaphore>,
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    registry: HashMap<JobKind, Registered>,
    queues: Vec<QueueClass>,
    poll_interval: Duration,
    grace_period: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            queue,
            registry: HashMap::new(),
            queues: QueueClass::ALL.to_vec(),
            poll_interval: Duration::from_millis(200),
            grace_period: Duration::from_secs(30),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn register(
        &mut self,
        kind: JobKind,
        handler: Arc<dyn TaskHandler>,
        options: HandlerOptions,
    ) {
        let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
        self.registry.insert(
            kind,
            Registered {
                handler,
                options,
                semaphore,
            },
        );
    }

    /// Handle used to stop the pool from outside the run loop.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Main loop: claim, dispatch, repeat until shutdown; then drain
    /// in-flight work for up to the grace period.
    pub async fn run(&self) {
        info!(
            kinds = self.registry.len(),
            "Worker pool started"
        );
        let mut inflight: JoinSet<()> = JoinSet::new();
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            // reap finished tasks without blocking
            while inflight.try_join_next().is_some() {}

            match self.queue.dequeue(&self.queues).await {
                Ok(Some(lease)) => {
                    self.dispatch(lease, &mut inflight).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Queue dequeue failed; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!(inflight = inflight.len(), "Worker pool draining");
        let deadline = Instant::now() + self.grace_period;
        while !inflight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(abandoned = inflight.len(), "Grace period elapsed; abandoning tasks");
                inflight.abort_all();
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                joined = inflight.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }
        info!("Worker pool stopped");
    }

    async fn dispatch(&self, lease: Lease, inflight: &mut JoinSet<()>) {
        let kind = lease.job.kind;
        let Some(registered) = self.registry.get(&kind) else {
            error!(kind = kind.as_str(), job_id = %lease.job.id, "No handler registered");
            let _ = self
                .queue
                .nack(&lease, "no handler registered for kind", true)
                .await;
            return;
        };

        // Saturated kinds pause intake here rather than piling up tasks.
        let permit = match registered.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let queue = Arc::clone(&self.queue);
        let handler = Arc::clone(&registered.handler);
        let timeout = registered.options.timeout;
        let ctx = TaskContext::new(self.shutdown_rx.clone());

        inflight.spawn(async move {
            let started = Instant::now();
            let job = lease.job.clone();

            let outcome = tokio::select! {
                run = tokio::time::timeout(
                    timeout,
                    AssertUnwindSafe(handler.run(&job, &ctx)).catch_unwind(),
                ) => match run {
                    Err(_) => Err(TaskError::Retryable(format!(
                        "handler timed out after {}s",
                        timeout.as_secs()
                    ))),
                    Ok(Err(_)) => Err(TaskError::Retryable("handler panicked".to_string())),
                    Ok(Ok(result)) => result,
                },
                _ = ctx.cancelled() => Err(TaskError::Retryable("shutdown".to_string())),
            };

            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            metrics::histogram!("agenttrace_handler_duration_ms", elapsed_ms, "kind" => kind.as_str());

            match outcome {
                Ok(()) => {
                    metrics::counter!("agenttrace_handler_success_total", 1, "kind" => kind.as_str());
                    if let Err(e) = queue.ack(&lease).await {
                        warn!(job_id = %job.id, error = %e, "Ack failed");
                    }
                }
                Err(task_err) => {
                    metrics::counter!("agenttrace_handler_failure_total", 1, "kind" => kind.as_str());
                    debug!(
                        job_id = %job.id,
                        kind = kind.as_str(),
                        permanent = task_err.is_permanent(),
                        error = task_err.message(),
                        "Handler failed"
                    );
                    if let Err(e) = queue
                        .nack(&lease, task_err.message(), task_err.is_permanent())
                        .await
                    {
                        warn!(job_id = %job.id, error = %e, "Nack failed");
                    }
                }
            }
            drop(permit);
        });
    }
}
