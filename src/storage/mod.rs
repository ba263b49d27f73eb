// Storage layer: pooled SQLite access for the three backing stores.

pub mod config_store;
pub mod database;
pub mod models;
pub mod telemetry_store;

pub use config_store::{ConfigStore, RaiseOutcome};
pub use database::{connect, health_check, StoreKind};
pub use telemetry_store::{
    AggregateBucket, CursorPosition, MetricPoint, TelemetryStore, TelemetryTable, TelemetryWrite,
    TraceFilter,
};
