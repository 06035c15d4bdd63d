//! Producer-facing pipeline: one queue plus the flusher that drains it

use crate::config::PipelineConfig;
use crate::telemetry::event::TelemetryEvent;
use crate::telemetry::flusher::{
    BatchFlusher, FlushStats, FlusherConfig, FlusherHandle, FlusherMonitor, FlusherState,
};
use crate::telemetry::queue::{event_queue, EventQueue};
use crate::telemetry::sink::DurableSink;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Snapshot reported by the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub events_enqueued: u64,
    pub events_dropped: u64,
    pub flusher_state: FlusherState,
    pub flush: FlushStats,
}

/// Telemetry pipeline, built once at startup and shared by handle
pub struct TelemetryPipeline {
    queue: EventQueue,
    monitor: FlusherMonitor,
    flusher: Mutex<Option<FlusherHandle>>,
}

impl TelemetryPipeline {
    /// Create the queue and spawn its flusher
    pub fn start<S: DurableSink>(sink: Arc<S>, config: &PipelineConfig) -> Self {
        let (queue, receiver) = event_queue(config.queue_capacity);
        let handle = BatchFlusher::spawn(receiver, sink, FlusherConfig::from(config));

        tracing::info!(
            queue_capacity = queue.capacity(),
            batch_size = config.batch_size,
            flush_interval_secs = config.flush_interval_secs,
            "Telemetry pipeline started"
        );

        Self {
            queue,
            monitor: handle.monitor(),
            flusher: Mutex::new(Some(handle)),
        }
    }

    /// Hand an event to the pipeline without waiting
    ///
    /// `false` means the event was dropped (queue full or shutting down).
    pub fn submit_event(&self, event: TelemetryEvent) -> bool {
        self.queue.enqueue(event)
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn status(&self) -> PipelineStatus {
        let queue_depth = self.queue.len();
        crate::metrics::set_queue_depth(queue_depth);

        PipelineStatus {
            queue_depth,
            queue_capacity: self.queue.capacity(),
            events_enqueued: self.queue.enqueued_count(),
            events_dropped: self.queue.dropped_count(),
            flusher_state: self.monitor.state(),
            flush: self.monitor.stats(),
        }
    }

    /// Stop the flusher and wait for its final drain
    ///
    /// Returns `None` if the pipeline was already shut down.
    pub async fn shutdown(&self) -> Option<FlushStats> {
        let handle = self.flusher.lock().await.take()?;

        tracing::info!(pending = self.queue.len(), "Shutting down telemetry pipeline");
        let stats = handle.stop().await;

        tracing::info!(
            events_written = stats.events_written,
            events_discarded = stats.events_discarded,
            events_dropped = self.queue.dropped_count(),
            "Telemetry pipeline stopped"
        );
        Some(stats)
    }
}
