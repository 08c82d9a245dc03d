//! Fixed-size concurrent batches of deferred work.
//!
//! Tasks queue up in order; a single drain task runs them `batch_size` at a
//! time and waits for the whole batch before starting the next. The drain task
//! exits when the queue empties and is respawned by the next enqueue.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use perch_core::PerchError;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

use crate::lock;

pub type BatchTask = BoxFuture<'static, Result<(), PerchError>>;

#[derive(Clone)]
pub struct TaskBatcher {
    inner: Arc<Inner>,
}

struct Inner {
    batch_size: usize,
    state: Mutex<State>,
    idle: Notify,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Default)]
struct State {
    queue: VecDeque<BatchTask>,
    draining: bool,
}

impl TaskBatcher {
    pub const DEFAULT_BATCH_SIZE: usize = 10;

    pub fn new(batch_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                batch_size: batch_size.max(1),
                state: Mutex::new(State::default()),
                idle: Notify::new(),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    /// Queue `task`, spawning the drain task if it is not running. Must be
    /// called from within a tokio runtime.
    pub fn enqueue<F>(&self, task: F)
    where
        F: Future<Output = Result<(), PerchError>> + Send + 'static,
    {
        let start = {
            let mut state = lock(&self.inner.state);
            state.queue.push_back(Box::pin(task));
            !std::mem::replace(&mut state.draining, true)
        };

        if start {
            trace!("batcher waking");
            let inner = self.inner.clone();
            tokio::spawn(inner.drain());
        }
    }

    /// Tasks queued but not yet started.
    pub fn pending(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    pub fn is_draining(&self) -> bool {
        lock(&self.inner.state).draining
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Wait until the queue is empty and the drain task has stopped.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = lock(&self.inner.state);
                if !state.draining && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl Default for TaskBatcher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BATCH_SIZE)
    }
}

impl Inner {
    async fn drain(self: Arc<Self>) {
        loop {
            let batch: Vec<BatchTask> = {
                let mut state = lock(&self.state);
                if state.queue.is_empty() {
                    state.draining = false;
                    drop(state);
                    self.idle.notify_waiters();
                    trace!("batcher dormant");
                    return;
                }
                let size = self.batch_size.min(state.queue.len());
                state.queue.drain(..size).collect()
            };

            let size = batch.len();
            let mut tasks = JoinSet::new();
            for task in batch {
                tasks.spawn(task);
            }

            let mut failed = 0;
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(Ok(())) => {
                        self.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(error)) => {
                        failed += 1;
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %error, "batched task failed");
                    }
                    Err(error) => {
                        failed += 1;
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        error!(error = %error, "batched task panicked");
                    }
                }
            }
            debug!(size, failed, "batch finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn runs_at_most_one_batch_at_a_time() {
        let batcher = TaskBatcher::new(10);
        let gauge = Arc::new(Gauge::default());

        for _ in 0..25 {
            let gauge = gauge.clone();
            batcher.enqueue(async move {
                gauge.enter();
                tokio::time::sleep(Duration::from_millis(5)).await;
                gauge.exit();
                Ok(())
            });
        }
        assert_eq!(batcher.pending(), 25);

        tokio::time::timeout(Duration::from_secs(5), batcher.idle())
            .await
            .expect("batcher should go idle");

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 10);
        assert_eq!(batcher.completed(), 25);
        assert_eq!(batcher.pending(), 0);
        assert!(!batcher.is_draining());
    }

    #[tokio::test]
    async fn failures_and_panics_do_not_halt_the_queue() {
        let batcher = TaskBatcher::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        batcher.enqueue(async { Err::<(), _>(PerchError::Internal("boom".into())) });
        let explode = true;
        batcher.enqueue(async move {
            if explode {
                panic!("task panicked");
            }
            Ok(())
        });
        for _ in 0..3 {
            let done = done.clone();
            batcher.enqueue(async move {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::timeout(Duration::from_secs(5), batcher.idle())
            .await
            .expect("batcher should go idle");

        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(batcher.failed(), 2);
        assert_eq!(batcher.completed(), 3);
    }

    #[tokio::test]
    async fn respawns_after_going_dormant() {
        let batcher = TaskBatcher::default();
        batcher.enqueue(async { Ok(()) });
        batcher.idle().await;
        assert!(!batcher.is_draining());

        batcher.enqueue(async { Ok(()) });
        assert!(batcher.is_draining());
        batcher.idle().await;
        assert_eq!(batcher.completed(), 2);
    }

    #[tokio::test]
    async fn idle_returns_immediately_when_empty() {
        let batcher = TaskBatcher::new(3);
        tokio::time::timeout(Duration::from_millis(100), batcher.idle())
            .await
            .expect("empty batcher is idle");
        assert_eq!(batcher.batch_size(), 3);
    }
}
