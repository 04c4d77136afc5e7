//! Named bounded worker pools.
//!
//! Blob I/O runs on the `snapshot` pool, cluster-state-driven callbacks on
//! the `generic` pool. Pools are semaphore-bounded spawners carrying a
//! task-local tag; [`assert_snapshot_or_generic`] is the debug-only knob
//! checking that blob I/O was scheduled through one of them.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{RepositoryError, Result};
use crate::listener::grouped;

tokio::task_local! {
    static CURRENT_POOL: PoolKind;
}

static POOL_ASSERTIONS: AtomicBool = AtomicBool::new(false);

/// Enable or disable the pool assertion knob. Off by default; the checks
/// compile away entirely in release builds.
pub fn set_pool_assertions(enabled: bool) {
    POOL_ASSERTIONS.store(enabled, Ordering::Relaxed);
}

/// Assert the current task was scheduled through the snapshot or generic
/// pool. The contract is "do not block a latency-critical pool with blob
/// I/O"; which pools qualify is fixed at {snapshot, generic}.
pub fn assert_snapshot_or_generic() {
    if cfg!(debug_assertions) && POOL_ASSERTIONS.load(Ordering::Relaxed) {
        debug_assert!(
            CURRENT_POOL.try_with(|_| ()).is_ok(),
            "blob I/O must run on the snapshot or generic pool"
        );
    }
}

/// Identity of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Snapshot,
    Generic,
}

/// A bounded executor: at most `capacity` submitted futures run at once,
/// the rest queue on the semaphore.
#[derive(Debug, Clone)]
pub struct Pool {
    kind: PoolKind,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl Pool {
    pub fn new(kind: PoolKind, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Run a future under a pool permit on the current task.
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("pool semaphore never closes");
        CURRENT_POOL.scope(self.kind, fut).await
    }

    /// Spawn a future onto the pool.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let pool = self.clone();
        tokio::spawn(async move { pool.run(fut).await })
    }
}

/// The two pools the engine schedules onto.
#[derive(Debug, Clone)]
pub struct Pools {
    pub snapshot: Pool,
    pub generic: Pool,
}

impl Default for Pools {
    fn default() -> Self {
        Self {
            snapshot: Pool::new(PoolKind::Snapshot, 5),
            generic: Pool::new(PoolKind::Generic, 8),
        }
    }
}

/// Drain a queue of work items through a bounded pool.
///
/// Spawns `min(pool capacity, queue length)` workers; each worker pulls the
/// next item until the queue runs dry. The first failure wins and remaining
/// items are dropped by the failing worker's siblings as they observe the
/// drained queue.
pub async fn run_queue<T, F, Fut>(pool: &Pool, items: Vec<T>, worker: F) -> Result<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    if items.is_empty() {
        return Ok(());
    }
    let workers = pool.capacity().min(items.len());
    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let (group, done) = grouped::<()>(workers);

    for _ in 0..workers {
        let queue = queue.clone();
        let worker = worker.clone();
        let group = group.clone();
        pool.spawn(async move {
            loop {
                let item = match queue.lock() {
                    Ok(mut queue) => queue.pop_front(),
                    Err(e) => {
                        group.on_response(Err(RepositoryError::Fatal(format!(
                            "worker queue lock poisoned: {e}"
                        ))));
                        return;
                    }
                };
                let Some(item) = item else {
                    group.on_response(Ok(()));
                    return;
                };
                if let Err(e) = worker(item).await {
                    group.on_response(Err(e));
                    return;
                }
            }
        });
    }

    done.wait().await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_run_queue_processes_everything() {
        let pool = Pool::new(PoolKind::Snapshot, 3);
        let counter = Arc::new(AtomicUsize::new(0));
        let items: Vec<usize> = (0..20).collect();
        let seen = counter.clone();
        run_queue(&pool, items, move |_item| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_run_queue_surfaces_first_failure() {
        let pool = Pool::new(PoolKind::Snapshot, 2);
        let err = run_queue(&pool, vec![1u32, 2, 3], move |item| async move {
            if item == 2 {
                Err(RepositoryError::Aborted)
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RepositoryError::Aborted));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = Pool::new(PoolKind::Generic, 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (running_ref, peak_ref) = (running.clone(), peak.clone());
        run_queue(&pool, (0..10).collect(), move |_item: usize| {
            let running = running_ref.clone();
            let peak = peak_ref.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_pool_tag_visible_inside_run() {
        let pool = Pool::new(PoolKind::Snapshot, 1);
        set_pool_assertions(true);
        pool.run(async {
            assert_snapshot_or_generic();
        })
        .await;
        set_pool_assertions(false);
    }
}
