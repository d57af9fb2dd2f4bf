use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

use saga_types::EnvelopeId;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool `{0}` is closed")]
    Closed(&'static str),

    #[error("worker in pool `{pool}` failed: {detail}")]
    Panicked { pool: &'static str, detail: String },
}

/// Bounded worker pool with per-envelope serialization.
/// Work on different envelopes runs concurrently, up to the pool size.
/// Work on the same envelope is serialized.
pub struct WorkerPool {
    name: &'static str,
    /// Per-envelope mutexes
    envelope_locks: Arc<Mutex<HashMap<EnvelopeId, Arc<Mutex<()>>>>>,
    size: usize,
    /// Semaphore for limiting total concurrency
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            envelope_locks: Arc::new(Mutex::new(HashMap::new())),
            size,
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    async fn envelope_lock(&self, envelope: EnvelopeId) -> Arc<Mutex<()>> {
        let mut locks = self.envelope_locks.lock().await;
        locks
            .entry(envelope)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `work` on the pool and wait for its result.
    ///
    /// The work runs on its own task, so it completes even if the caller
    /// stops waiting.
    pub async fn run<Fut>(&self, envelope: EnvelopeId, work: Fut) -> Result<Fut::Output, PoolError>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed(self.name))?;
        let lock = self.envelope_lock(envelope).await;

        let handle = tokio::spawn(async move {
            let _guard = lock.lock().await;
            let out = work.await;
            drop(permit);
            out
        });
        let result = handle.await.map_err(|e| PoolError::Panicked {
            pool: self.name,
            detail: e.to_string(),
        });
        self.cleanup().await;
        result
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of envelopes with a lock entry.
    pub async fn active_envelopes(&self) -> usize {
        self.envelope_locks.lock().await.len()
    }

    /// Drop locks for envelopes no longer being processed.
    pub async fn cleanup(&self) {
        let mut locks = self.envelope_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Refuse new work. Work already admitted finishes.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn runs_work_and_returns_output() {
        let pool = WorkerPool::new("test", 4);
        let result = pool.run(EnvelopeId::random(), async { 42 }).await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(pool.active_envelopes().await, 0);
    }

    #[tokio::test]
    async fn different_envelopes_run_in_parallel() {
        let pool = Arc::new(WorkerPool::new("test", 4));
        let start = Instant::now();
        let mut handles = Vec::new();

        for i in 0..4u32 {
            let p = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                p.run(EnvelopeId::random(), async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    i
                })
                .await
                .unwrap()
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert!(
            start.elapsed() < Duration::from_millis(180),
            "expected parallel execution, took {:?}",
            start.elapsed()
        );
        results.sort();
        assert_eq!(results, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn same_envelope_is_serialized() {
        let pool = Arc::new(WorkerPool::new("test", 4));
        let envelope = EnvelopeId::random();
        let inside = Arc::new(AtomicU64::new(0));
        let overlap = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let p = Arc::clone(&pool);
            let inside = Arc::clone(&inside);
            let overlap = Arc::clone(&overlap);
            handles.push(tokio::spawn(async move {
                p.run(envelope, async move {
                    if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pool_size_limits_concurrency() {
        let pool = Arc::new(WorkerPool::new("test", 2));
        let concurrent = Arc::new(AtomicU64::new(0));
        let max_seen = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let p = Arc::clone(&pool);
            let c = Arc::clone(&concurrent);
            let m = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                p.run(EnvelopeId::random(), async move {
                    let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                    m.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    c.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn closed_pool_refuses_work() {
        let pool = WorkerPool::new("test", 1);
        pool.close();
        let err = pool.run(EnvelopeId::random(), async {}).await.unwrap_err();
        assert!(matches!(err, PoolError::Closed("test")));
    }

    #[tokio::test]
    async fn panicking_work_surfaces_as_error() {
        let pool = WorkerPool::new("test", 1);
        let err = pool
            .run(EnvelopeId::random(), async { panic!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Panicked { .. }));
        // The permit was released when the task unwound.
        assert_eq!(pool.run(EnvelopeId::random(), async { 1 }).await.unwrap(), 1);
    }
}
