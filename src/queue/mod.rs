// Durable priority job queue.

pub mod backoff;
pub mod job;
pub mod sql;

pub use backoff::ExponentialBackoff;
pub use job::{EnqueueOptions, Job, JobKind, JobStatus, Lease, QueueClass};
pub use sql::{JobQueue, SqlJobQueue};
