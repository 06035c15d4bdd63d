//! Background batch flusher
//!
//! The only path from the in-memory queue to durable storage:
//! - Size trigger: flush as soon as the batch holds `batch_size` events
//! - Time trigger: flush once the oldest unflushed event is `flush_interval` old
//! - Shutdown: close the queue, drain what is buffered, flush once more
//!
//! A failed write is logged and the batch is discarded; events are never
//! re-enqueued. Opt-in retries (`max_retries`) back off exponentially.

use crate::config::PipelineConfig;
use crate::error::SinkError;
use crate::telemetry::event::TelemetryEvent;
use crate::telemetry::queue::{EventReceiver, Received};
use crate::telemetry::sink::DurableSink;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);
const JITTER_RATIO: f64 = 0.2;

/// Lifecycle of the flusher task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlusherState {
    Idle,
    Accumulating,
    Flushing,
    Draining,
    Stopped,
}

/// What caused a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Interval,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Interval => "interval",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlusherConfig {
    /// Flush as soon as this many events are buffered
    pub batch_size: usize,
    /// Flush a non-empty batch once its oldest event is this old
    pub flush_interval: Duration,
    /// Upper bound on one wait for the next event
    pub poll_timeout: Duration,
    /// Abort a sink write that takes longer than this
    pub write_timeout: Option<Duration>,
    /// Extra write attempts per batch before it is discarded
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each further attempt
    pub retry_backoff: Duration,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            write_timeout: None,
            max_retries: 0,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl From<&PipelineConfig> for FlusherConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: Duration::from_secs(config.flush_interval_secs),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            write_timeout: config.sink_write_timeout_secs.map(Duration::from_secs),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Default)]
struct FlushCounters {
    batches_written: AtomicU64,
    events_written: AtomicU64,
    batches_failed: AtomicU64,
    events_discarded: AtomicU64,
}

impl FlushCounters {
    fn snapshot(&self) -> FlushStats {
        FlushStats {
            batches_written: self.batches_written.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Cumulative flush outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    pub batches_written: u64,
    pub events_written: u64,
    pub batches_failed: u64,
    pub events_discarded: u64,
}

/// Read-only view of a running flusher
#[derive(Debug, Clone)]
pub struct FlusherMonitor {
    state: watch::Receiver<FlusherState>,
    counters: Arc<FlushCounters>,
}

impl FlusherMonitor {
    pub fn state(&self) -> FlusherState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> FlushStats {
        self.counters.snapshot()
    }
}

/// Owner handle of the flusher task
///
/// Dropping the handle without calling [`FlusherHandle::stop`] also triggers
/// the shutdown drain, but nobody waits for it.
pub struct FlusherHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<FlushStats>,
    monitor: FlusherMonitor,
}

impl FlusherHandle {
    pub fn state(&self) -> FlusherState {
        self.monitor.state()
    }

    pub fn stats(&self) -> FlushStats {
        self.monitor.stats()
    }

    pub fn monitor(&self) -> FlusherMonitor {
        self.monitor.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal shutdown and wait for the final drain and flush to complete
    pub async fn stop(mut self) -> FlushStats {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        match self.join.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "Batch flusher task failed");
                self.monitor.stats()
            }
        }
    }
}

/// The flusher task state
pub struct BatchFlusher<S: DurableSink> {
    sink: Arc<S>,
    receiver: EventReceiver,
    config: FlusherConfig,
    batch: Vec<TelemetryEvent>,
    /// When the first event of the current batch arrived
    batch_opened: Option<Instant>,
    state: watch::Sender<FlusherState>,
    counters: Arc<FlushCounters>,
}

impl<S: DurableSink> BatchFlusher<S> {
    /// Spawn the flusher on the current tokio runtime
    ///
    /// # Example
    ///
    /// ```ignore
    /// let (queue, receiver) = event_queue(1000);
    /// let handle = BatchFlusher::spawn(receiver, Arc::new(sink), FlusherConfig::default());
    /// queue.enqueue(event);
    /// let stats = handle.stop().await;
    /// ```
    pub fn spawn(receiver: EventReceiver, sink: Arc<S>, config: FlusherConfig) -> FlusherHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(FlusherState::Idle);
        let counters = Arc::new(FlushCounters::default());

        let flusher = Self {
            sink,
            receiver,
            batch: Vec::with_capacity(config.batch_size),
            config,
            batch_opened: None,
            state: state_tx,
            counters: counters.clone(),
        };

        let join = tokio::spawn(flusher.run(shutdown_rx));

        FlusherHandle {
            shutdown: Some(shutdown_tx),
            join,
            monitor: FlusherMonitor {
                state: state_rx,
                counters,
            },
        }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> FlushStats {
        tracing::info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "Batch flusher started"
        );

        loop {
            let received = tokio::select! {
                biased;

                _ = &mut shutdown => break,
                received = self.receiver.recv_timeout(self.config.poll_timeout) => received,
            };

            match received {
                Received::Event(event) => {
                    if self.batch.is_empty() {
                        self.batch_opened = Some(Instant::now());
                        self.set_state(FlusherState::Accumulating);
                    }
                    self.batch.push(event);

                    if self.batch.len() >= self.config.batch_size {
                        self.flush(FlushTrigger::Size).await;
                    } else if self.interval_elapsed() {
                        self.flush(FlushTrigger::Interval).await;
                    }
                }
                Received::Timeout => {
                    if self.interval_elapsed() {
                        self.flush(FlushTrigger::Interval).await;
                    }
                }
                Received::Closed => {
                    tracing::debug!("All event producers dropped, stopping flusher");
                    break;
                }
            }
        }

        self.drain().await;
        self.set_state(FlusherState::Stopped);

        let stats = self.counters.snapshot();
        tracing::info!(
            batches_written = stats.batches_written,
            events_written = stats.events_written,
            batches_failed = stats.batches_failed,
            events_discarded = stats.events_discarded,
            "Batch flusher stopped"
        );
        stats
    }

    fn interval_elapsed(&self) -> bool {
        self.batch_opened
            .is_some_and(|opened| opened.elapsed() >= self.config.flush_interval)
    }

    async fn flush(&mut self, trigger: FlushTrigger) {
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.config.batch_size));
        self.batch_opened = None;

        self.set_state(FlusherState::Flushing);
        write_batch(&*self.sink, batch, trigger, &self.config, &self.counters).await;
        self.set_state(FlusherState::Accumulating);
    }

    async fn drain(&mut self) {
        self.set_state(FlusherState::Draining);
        self.receiver.close();

        let mut drained = 0usize;
        while let Some(event) = self.receiver.try_recv() {
            self.batch.push(event);
            drained += 1;
        }

        tracing::info!(
            drained = drained,
            pending = self.batch.len(),
            "Draining event queue before shutdown"
        );

        if !self.batch.is_empty() {
            let batch = std::mem::take(&mut self.batch);
            write_batch(&*self.sink, batch, FlushTrigger::Shutdown, &self.config, &self.counters)
                .await;
        }
    }

    fn set_state(&self, state: FlusherState) {
        self.state.send_replace(state);
    }
}

/// Write one batch, consuming it
///
/// Outcomes land in `counters`; a batch that still fails after the last
/// retry is dropped.
async fn write_batch<S: DurableSink>(
    sink: &S,
    batch: Vec<TelemetryEvent>,
    trigger: FlushTrigger,
    config: &FlusherConfig,
    counters: &FlushCounters,
) {
    let count = batch.len();
    let start = std::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        let result = match config.write_timeout {
            Some(limit) => tokio::time::timeout(limit, write_once(sink, &batch))
                .await
                .unwrap_or(Err(SinkError::Timeout(limit))),
            None => write_once(sink, &batch).await,
        };

        match result {
            Ok(()) => {
                let elapsed = start.elapsed();
                counters.batches_written.fetch_add(1, Ordering::Relaxed);
                counters.events_written.fetch_add(count as u64, Ordering::Relaxed);
                crate::metrics::record_batch_flushed(trigger.as_str(), count, elapsed);

                tracing::debug!(
                    count = count,
                    trigger = trigger.as_str(),
                    attempts = attempt + 1,
                    duration_ms = elapsed.as_millis() as u64,
                    "Flushed telemetry batch"
                );
                return;
            }
            Err(e) if attempt < config.max_retries => {
                attempt += 1;
                let delay = retry_backoff(config.retry_backoff, attempt);
                tracing::warn!(
                    error = %e,
                    count = count,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Telemetry batch write failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let elapsed = start.elapsed();
                counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                counters.events_discarded.fetch_add(count as u64, Ordering::Relaxed);
                crate::metrics::record_batch_failed(trigger.as_str(), count, elapsed);

                tracing::error!(
                    error = %e,
                    count = count,
                    trigger = trigger.as_str(),
                    "Failed to flush telemetry batch, discarding it"
                );
                return;
            }
        }
    }
}

/// One transaction: begin, bulk insert, commit (rollback on insert failure)
async fn write_once<S: DurableSink>(sink: &S, rows: &[TelemetryEvent]) -> Result<(), SinkError> {
    let mut tx = sink.begin().await?;

    if let Err(e) = sink.bulk_insert(&mut tx, rows).await {
        if let Err(rollback_err) = sink.rollback(tx).await {
            tracing::warn!(error = %rollback_err, "Failed to roll back telemetry batch");
        }
        return Err(e);
    }

    sink.commit(tx).await
}

/// Exponential backoff with ±20% jitter, capped at 30 seconds
fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    use rand::Rng;

    let exponent = attempt.saturating_sub(1).min(16);
    let backoff = base
        .saturating_mul(1u32 << exponent)
        .min(MAX_RETRY_BACKOFF);

    let jitter_range = backoff.mul_f64(JITTER_RATIO);
    let jitter = rand::thread_rng().gen_range(0.0..=2.0);
    backoff
        .saturating_sub(jitter_range)
        .saturating_add(jitter_range.mul_f64(jitter))
}
