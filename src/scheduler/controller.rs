//! Bounded-parallelism launcher.
//!
//! Every generator kind gets its own lane: a counting semaphore sized by the
//! run configuration (default 1) plus an optional fixed stagger between
//! successive launches. Launching checks the run's [`CancelToken`] before
//! and after waiting; once cancellation is observed no new work starts.
//! Work that already started is never interrupted here.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::generation::GeneratorKind;

/// Default number of concurrent launches per kind.
pub const DEFAULT_KIND_CONCURRENCY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Run was cancelled before launch")]
pub struct Cancelled;

/// Cooperative run-level cancellation flag.
///
/// Cheap to clone; all clones observe the same flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

struct Lane {
    semaphore: Arc<Semaphore>,
    limit: usize,
    next_launch: Mutex<Option<Instant>>,
}

impl Lane {
    fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            next_launch: Mutex::new(None),
        }
    }
}

/// Held for the duration of one launched unit of work.
pub struct LaunchPermit {
    kind: GeneratorKind,
    _permit: OwnedSemaphorePermit,
}

impl LaunchPermit {
    pub fn kind(&self) -> GeneratorKind {
        self.kind
    }
}

pub struct ConcurrencyController {
    lanes: HashMap<GeneratorKind, Lane>,
    stagger: Duration,
    cancel: CancelToken,
}

impl ConcurrencyController {
    /// Creates a controller with a lane for every kind.
    ///
    /// Kinds missing from `limits` get [`DEFAULT_KIND_CONCURRENCY`]. A limit
    /// of zero is raised to one.
    pub fn new(
        limits: &HashMap<GeneratorKind, usize>,
        stagger: Duration,
        cancel: CancelToken,
    ) -> Self {
        let lanes = GeneratorKind::all()
            .into_iter()
            .map(|kind| {
                let limit = limits
                    .get(&kind)
                    .copied()
                    .unwrap_or(DEFAULT_KIND_CONCURRENCY);
                (kind, Lane::new(limit))
            })
            .collect();
        Self {
            lanes,
            stagger,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn limit(&self, kind: GeneratorKind) -> usize {
        self.lane(kind).limit
    }

    /// Number of launches of `kind` currently holding a permit.
    pub fn in_flight(&self, kind: GeneratorKind) -> usize {
        let lane = self.lane(kind);
        lane.limit - lane.semaphore.available_permits()
    }

    fn lane(&self, kind: GeneratorKind) -> &Lane {
        // Every kind has a lane from construction.
        &self.lanes[&kind]
    }

    /// Waits for a free slot in the kind's lane, then for the stagger window.
    pub async fn acquire(&self, kind: GeneratorKind) -> Result<LaunchPermit, Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let lane = self.lane(kind);

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Cancelled),
            permit = Arc::clone(&lane.semaphore).acquire_owned() => {
                permit.map_err(|_| Cancelled)?
            }
        };

        if !self.stagger.is_zero() {
            let wait_until = {
                let mut next = lane.next_launch.lock().await;
                let now = Instant::now();
                let slot = match *next {
                    Some(at) if at > now => at,
                    _ => now,
                };
                *next = Some(slot + self.stagger);
                slot
            };
            if wait_until > Instant::now() {
                debug!(kind = %kind, "Staggering launch");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Cancelled),
                    _ = tokio::time::sleep_until(wait_until) => {}
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }

        Ok(LaunchPermit {
            kind,
            _permit: permit,
        })
    }

    /// Acquires a permit, runs `work` to completion, and releases the permit.
    pub async fn run<F, T>(&self, kind: GeneratorKind, work: F) -> Result<T, Cancelled>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire(kind).await?;
        Ok(work.await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinSet;

    fn limits(kind: GeneratorKind, limit: usize) -> HashMap<GeneratorKind, usize> {
        HashMap::from([(kind, limit)])
    }

    #[tokio::test]
    async fn test_lane_limit_is_respected() {
        let controller = Arc::new(ConcurrencyController::new(
            &limits(GeneratorKind::TextTransform, 2),
            Duration::ZERO,
            CancelToken::new(),
        ));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..6 {
            let controller = Arc::clone(&controller);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                controller
                    .run(GeneratorKind::TextTransform, async {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.expect("join").is_ok());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_default_limit_is_one() {
        let controller =
            ConcurrencyController::new(&HashMap::new(), Duration::ZERO, CancelToken::new());
        for kind in GeneratorKind::all() {
            assert_eq!(controller.limit(kind), DEFAULT_KIND_CONCURRENCY);
        }
        let permit = controller
            .acquire(GeneratorKind::MultiAgent)
            .await
            .expect("permit");
        assert_eq!(permit.kind(), GeneratorKind::MultiAgent);
        assert_eq!(controller.in_flight(GeneratorKind::MultiAgent), 1);
        drop(permit);
        assert_eq!(controller.in_flight(GeneratorKind::MultiAgent), 0);
    }

    #[tokio::test]
    async fn test_kinds_do_not_share_lanes() {
        let controller =
            ConcurrencyController::new(&HashMap::new(), Duration::ZERO, CancelToken::new());
        let _held = controller
            .acquire(GeneratorKind::DeepResearch)
            .await
            .expect("permit");
        let other = tokio::time::timeout(
            Duration::from_millis(100),
            controller.acquire(GeneratorKind::TextTransform),
        )
        .await;
        assert!(matches!(other, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_stagger_spaces_launches() {
        let controller = ConcurrencyController::new(
            &limits(GeneratorKind::ResearchReport, 3),
            Duration::from_millis(50),
            CancelToken::new(),
        );
        let start = Instant::now();
        let _a = controller.acquire(GeneratorKind::ResearchReport).await.expect("a");
        let _b = controller.acquire(GeneratorKind::ResearchReport).await.expect("b");
        let _c = controller.acquire(GeneratorKind::ResearchReport).await.expect("c");
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_cancel_blocks_new_launches() {
        let cancel = CancelToken::new();
        let controller =
            ConcurrencyController::new(&HashMap::new(), Duration::ZERO, cancel.clone());
        let held = controller
            .acquire(GeneratorKind::TextTransform)
            .await
            .expect("permit");

        let waiting = controller.acquire(GeneratorKind::TextTransform);
        cancel.cancel();
        assert!(matches!(waiting.await, Err(Cancelled)));
        drop(held);

        let after = controller.run(GeneratorKind::TextTransform, async { 1 }).await;
        assert_eq!(after, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_token_resolves_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        assert!(!token.is_cancelled());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("join");
        assert!(token.is_cancelled());
    }
}
