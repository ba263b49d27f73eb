// Metric-level anomaly detection and alerting.

pub mod detector;
pub mod methods;

pub use detector::{AlertEvent, AnomalyScanHandler, AnomalyScanPayload};
pub use methods::{evaluate, trailing_in_band, MethodOutcome};
