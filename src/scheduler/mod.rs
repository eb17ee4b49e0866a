//! Launch scheduling and phase gating for a run.
//!
//! - **ConcurrencyController**: per-generator-kind counting semaphores with an
//!   optional stagger between launches of the same kind, and a run-level
//!   cancellation signal checked before every launch.
//! - **InflightTracker**: named-bucket watermark gates. Each bucket declares
//!   how many completions it expects and releases a one-shot signal, which
//!   any number of waiters can await, once that count is reached.
//!
//! Both are plain instances owned by the run executor; nothing here is
//! process-global.

pub mod controller;
pub mod inflight;

pub use controller::{CancelToken, Cancelled, ConcurrencyController, LaunchPermit};
pub use inflight::{BucketProgress, InflightTracker, TrackerError};
