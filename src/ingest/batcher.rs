// In-process accumulator that coalesces telemetry writes per destination
// table and flushes on size, age or shutdown.
//
// A failed flush is parked on the durable queue as a telemetry_flush job and
// replayed with backoff. Rows buffered in memory but not yet enqueued are
// lost on crash; the ingest ack only ever promises "queued for persistence".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::IngestConfig;
use crate::domain::{AgentTraceError, Result};
use crate::queue::{EnqueueOptions, JobKind, JobQueue, QueueClass};
use crate::storage::{TelemetryStore, TelemetryTable, TelemetryWrite};
use crate::worker::{TaskContext, TaskError, TaskHandler, TaskResult};

const FLUSH_RETRY_BASE_MS: u64 = 100;
const FLUSH_RETRY_MAX_ATTEMPTS: u32 = 8;

#[derive(Debug, Default)]
struct TableBuffer {
    rows: Vec<TelemetryWrite>,
    oldest: Option<Instant>,
}

struct TableState {
    buffer: Mutex<TableBuffer>,
    notify: Notify,
}

struct BatcherInner {
    store: TelemetryStore,
    queue: Arc<dyn JobQueue>,
    max_rows: usize,
    max_delay: Duration,
    high_water: usize,
    total: AtomicUsize,
    tables: HashMap<TelemetryTable, TableState>,
    shutdown_rx: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct IngestBatcher {
    inner: Arc<BatcherInner>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl IngestBatcher {
    /// Build the batcher and start one flusher task per destination table.
    pub fn start(store: TelemetryStore, queue: Arc<dyn JobQueue>, config: &IngestConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tables = TelemetryTable::ALL
            .into_iter()
            .map(|table| {
                (
                    table,
                    TableState {
                        buffer: Mutex::new(TableBuffer::default()),
                        notify: Notify::new(),
                    },
                )
            })
            .collect();

        let inner = Arc::new(BatcherInner {
            store,
            queue,
            max_rows: config.max_batch_rows,
            max_delay: Duration::from_millis(config.max_batch_delay_ms),
            high_water: config.high_water_rows,
            total: AtomicUsize::new(0),
            tables,
            shutdown_rx,
        });

        let mut tasks = Vec::new();
        for table in TelemetryTable::ALL {
            let inner = Arc::clone(&inner);
            tasks.push(tokio::spawn(async move {
                run_flusher(inner, table).await;
            }));
        }

        Self {
            inner,
            shutdown_tx: Arc::new(shutdown_tx),
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }

    /// Enroll a write for persistence. Applied in submission order within a
    /// destination table.
    pub async fn submit(&self, write: TelemetryWrite) -> Result<()> {
        if self.inner.total.load(Ordering::Relaxed) >= self.inner.high_water {
            metrics::counter!("agenttrace_ingest_backpressure_total", 1);
            return Err(AgentTraceError::Backpressure);
        }

        let table = write.table();
        let state = self
            .inner
            .tables
            .get(&table)
            .ok_or_else(|| AgentTraceError::internal("unknown destination table"))?;

        let full = {
            let mut buffer = state.buffer.lock().await;
            if buffer.rows.is_empty() {
                buffer.oldest = Some(Instant::now());
            }
            buffer.rows.push(write);
            buffer.rows.len() >= self.inner.max_rows
        };
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!(
            "agenttrace_ingest_buffered_rows",
            self.inner.total.load(Ordering::Relaxed) as f64
        );

        if full {
            state.notify.notify_one();
        }
        Ok(())
    }

    /// Rows currently buffered across all tables.
    pub fn buffered_rows(&self) -> usize {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Flush remaining buffers and stop the flusher tasks.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}

async fn run_flusher(inner: Arc<BatcherInner>, table: TelemetryTable) {
    let state = match inner.tables.get(&table) {
        Some(state) => state,
        None => return,
    };
    let mut shutdown = inner.shutdown_rx.clone();

    loop {
        let shutting_down = *shutdown.borrow();

        let (drained, wait) = {
            let mut buffer = state.buffer.lock().await;
            let age_due = buffer
                .oldest
                .map(|first| first.elapsed() >= inner.max_delay)
                .unwrap_or(false);
            if !buffer.rows.is_empty()
                && (buffer.rows.len() >= inner.max_rows || age_due || shutting_down)
            {
                buffer.oldest = None;
                (Some(std::mem::take(&mut buffer.rows)), Duration::ZERO)
            } else {
                let wait = buffer
                    .oldest
                    .map(|first| inner.max_delay.saturating_sub(first.elapsed()))
                    .unwrap_or(inner.max_delay);
                (None, wait)
            }
        };

        if let Some(rows) = drained {
            inner.total.fetch_sub(rows.len(), Ordering::Relaxed);
            flush(&inner, table, rows).await;
            continue;
        }

        if shutting_down {
            break;
        }

        tokio::select! {
            _ = state.notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {}
        }
    }
    debug!(table = table.as_str(), "Flusher stopped");
}

async fn flush(inner: &BatcherInner, table: TelemetryTable, rows: Vec<TelemetryWrite>) {
    let count = rows.len();
    match inner.store.insert_batch(&rows).await {
        Ok(()) => {
            metrics::counter!("agenttrace_ingest_flushed_rows_total", count as u64, "table" => table.as_str());
        }
        Err(e) => {
            warn!(
                table = table.as_str(),
                rows = count,
                error = %e,
                "Flush failed; parking batch on the durable queue"
            );
            let payload = match serde_json::to_value(FlushPayload { writes: rows }) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "Failed to serialize flush batch; rows dropped");
                    return;
                }
            };
            let enqueued = inner
                .queue
                .enqueue(
                    JobKind::TelemetryFlush,
                    payload,
                    EnqueueOptions::default()
                        .queue(QueueClass::Critical)
                        .max_retry(FLUSH_RETRY_MAX_ATTEMPTS)
                        .backoff_base_ms(FLUSH_RETRY_BASE_MS)
                        .timeout_secs(60),
                )
                .await;
            match enqueued {
                Ok(job_id) => {
                    metrics::counter!("agenttrace_ingest_flush_parked_total", 1, "table" => table.as_str());
                    debug!(job_id = %job_id, "Flush batch parked for retry");
                }
                Err(e) => {
                    // Both stores are down; this is the documented loss window.
                    error!(error = %e, rows = count, "Failed to park flush batch; rows dropped");
                }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlushPayload {
    pub writes: Vec<TelemetryWrite>,
}

/// Second-chance handler replaying a parked flush batch.
pub struct TelemetryFlushHandler {
    store: TelemetryStore,
}

impl TelemetryFlushHandler {
    pub fn new(store: TelemetryStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for TelemetryFlushHandler {
    async fn run(&self, job: &crate::queue::Job, _ctx: &TaskContext) -> TaskResult {
        let payload: FlushPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| TaskError::Permanent(format!("corrupt flush payload: {e}")))?;
        self.store
            .insert_batch(&payload.writes)
            .await
            .map_err(TaskError::from)?;
        Ok(())
    }
}
