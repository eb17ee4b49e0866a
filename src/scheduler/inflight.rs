//! Named-bucket watermark gates.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("Unknown bucket: {0}")]
    UnknownBucket(String),

    #[error("Bucket '{0}' was closed before its watermark was reached")]
    Closed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketProgress {
    pub expected: usize,
    pub completed: usize,
}

impl BucketProgress {
    pub fn is_released(&self) -> bool {
        self.completed >= self.expected
    }
}

struct Bucket {
    expected: usize,
    completed: usize,
    gate: watch::Sender<bool>,
}

impl Bucket {
    fn progress(&self) -> BucketProgress {
        BucketProgress {
            expected: self.expected,
            completed: self.completed,
        }
    }

    fn refresh_gate(&self) {
        let released = self.completed >= self.expected;
        if released && !*self.gate.borrow() {
            self.gate.send_replace(true);
        }
    }
}

/// Tracks completions per bucket and opens each bucket's gate exactly once.
#[derive(Default)]
pub struct InflightTracker {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bucket>> {
        // Bucket state stays consistent even if a holder panicked.
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declares `expected` more completions for `name`.
    ///
    /// Registering an empty bucket releases its gate immediately. Registering
    /// more work on an already released bucket does not close the gate again.
    pub fn register(&self, name: &str, expected: usize) {
        let mut buckets = self.lock();
        let bucket = buckets.entry(name.to_string()).or_insert_with(|| Bucket {
            expected: 0,
            completed: 0,
            gate: watch::channel(false).0,
        });
        bucket.expected += expected;
        bucket.refresh_gate();
        debug!(
            bucket = name,
            expected = bucket.expected,
            completed = bucket.completed,
            "Registered bucket"
        );
    }

    /// Records one completion and returns the bucket's progress.
    pub fn complete(&self, name: &str) -> Result<BucketProgress, TrackerError> {
        let mut buckets = self.lock();
        let bucket = buckets
            .get_mut(name)
            .ok_or_else(|| TrackerError::UnknownBucket(name.to_string()))?;
        bucket.completed += 1;
        if bucket.completed > bucket.expected {
            warn!(
                bucket = name,
                expected = bucket.expected,
                completed = bucket.completed,
                "Bucket completed more tasks than registered"
            );
        }
        bucket.refresh_gate();
        Ok(bucket.progress())
    }

    pub fn progress(&self, name: &str) -> Option<BucketProgress> {
        self.lock().get(name).map(Bucket::progress)
    }

    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Blocks until the bucket's watermark is reached.
    pub async fn wait(&self, name: &str) -> Result<(), TrackerError> {
        let mut rx = {
            let buckets = self.lock();
            buckets
                .get(name)
                .ok_or_else(|| TrackerError::UnknownBucket(name.to_string()))?
                .gate
                .subscribe()
        };
        rx.wait_for(|released| *released)
            .await
            .map(|_| ())
            .map_err(|_| TrackerError::Closed(name.to_string()))
    }

    /// Blocks until every named bucket is released.
    pub async fn wait_all<S: AsRef<str>>(&self, names: &[S]) -> Result<(), TrackerError> {
        for name in names {
            self.wait(name.as_ref()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gate_opens_at_watermark() {
        let tracker = Arc::new(InflightTracker::new());
        tracker.register("rest", 2);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait("rest").await })
        };

        tracker.complete("rest").expect("complete");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let progress = tracker.complete("rest").expect("complete");
        assert!(progress.is_released());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("released")
            .expect("join")
            .expect("wait");
    }

    #[tokio::test]
    async fn test_many_waiters_release_together() {
        let tracker = Arc::new(InflightTracker::new());
        tracker.register("deep", 1);
        let mut waiters = Vec::new();
        for _ in 0..5 {
            let tracker = Arc::clone(&tracker);
            waiters.push(tokio::spawn(async move { tracker.wait("deep").await }));
        }
        tracker.complete("deep").expect("complete");
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("released")
                .expect("join")
                .expect("wait");
        }
    }

    #[tokio::test]
    async fn test_empty_bucket_is_released() {
        let tracker = InflightTracker::new();
        tracker.register("none", 0);
        tracker.wait("none").await.expect("released immediately");
    }

    #[tokio::test]
    async fn test_unknown_bucket() {
        let tracker = InflightTracker::new();
        assert_eq!(
            tracker.wait("missing").await,
            Err(TrackerError::UnknownBucket("missing".into()))
        );
        assert!(tracker.complete("missing").is_err());
    }

    #[tokio::test]
    async fn test_buckets_are_independent() {
        let tracker = InflightTracker::new();
        tracker.register("a", 1);
        tracker.register("b", 1);
        tracker.complete("a").expect("complete");
        assert!(tracker.progress("a").expect("a").is_released());
        assert!(!tracker.progress("b").expect("b").is_released());
        assert!(
            tokio::time::timeout(Duration::from_millis(30), tracker.wait_all(&["a", "b"]))
                .await
                .is_err()
        );
        assert_eq!(tracker.bucket_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_register_accumulates() {
        let tracker = InflightTracker::new();
        tracker.register("x", 1);
        tracker.register("x", 2);
        assert_eq!(
            tracker.progress("x"),
            Some(BucketProgress {
                expected: 3,
                completed: 0
            })
        );
    }
}
