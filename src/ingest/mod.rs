// Ingest path: event envelopes, rate limiting, batching and the write API.

pub mod api;
pub mod batcher;
pub mod event;
pub mod ratelimit;

pub use batcher::{IngestBatcher, TelemetryFlushHandler};
pub use event::{EventAck, EventBody, IngestEnvelope, IngestResponse, SideEffect};
pub use ratelimit::{ProjectRateLimiter, RateDecision};
