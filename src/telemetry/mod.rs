//! Telemetry ingestion pipeline
//!
//! ```text
//! request handlers ──enqueue──▶ EventQueue (bounded, drop-newest)
//!                                   │
//!                          BatchFlusher (single consumer)
//!                                   │ size / interval / shutdown
//!                                   ▼
//!                             DurableSink (one transaction per batch)
//! ```

pub mod event;
pub mod flusher;
pub mod pipeline;
pub mod queue;
pub mod sink;

pub use event::{Component, RequestStatus, TelemetryEvent, UserRole};
pub use flusher::{BatchFlusher, FlushStats, FlusherConfig, FlusherHandle, FlusherState};
pub use pipeline::{PipelineStatus, TelemetryPipeline};
pub use queue::{event_queue, EventQueue, EventReceiver};
pub use sink::{DurableSink, SqliteSink};
