//! Prometheus metrics for run execution.
//!
//! Each executor owns a [`RunMetrics`] with its own registry; nothing is
//! registered globally, so concurrent runs and tests never collide.
//!
//! ```ignore
//! use docforge::metrics::RunMetrics;
//!
//! let metrics = RunMetrics::new()?;
//! metrics.record_task("text-transform", "succeeded", 12.5);
//! std::fs::write("metrics.prom", metrics.export())?;
//! ```

pub mod prometheus;

pub use self::prometheus::RunMetrics;
