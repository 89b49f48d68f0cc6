//! Telemetry for the proxy.
//!
//! - `recorder`: scheduler-owned wait/service samples and percentiles
//! - `prometheus`: export on an owned registry

pub mod prometheus;
pub mod recorder;

pub use self::prometheus::PrometheusMetrics;
pub use recorder::{MetricsRecorder, Percentiles, RecorderSnapshot};
