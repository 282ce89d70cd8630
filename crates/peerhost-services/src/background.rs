//! Background task queue for side work that must not block a response.
//!
//! Tasks carry their own retry policy. Outcomes are logged and counted so a
//! failing side effect shows up in stats instead of vanishing.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peerhost_core::{retry, RetryPolicy, Verdict};

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type TaskFn = Box<dyn FnMut(u32) -> TaskFuture + Send>;

struct BackgroundTask {
    name: &'static str,
    policy: RetryPolicy,
    run: TaskFn,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Rejected because the queue was full or closed.
    pub dropped: u64,
}

#[derive(Clone)]
pub struct BackgroundQueue {
    tx: mpsc::Sender<BackgroundTask>,
    counters: Arc<Counters>,
}

impl BackgroundQueue {
    /// Start the queue's consumer. Dropping every handle closes the queue;
    /// the returned join handle finishes once in-flight tasks are spawned.
    pub fn start(capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<BackgroundTask>(capacity.max(1));
        let counters = Arc::new(Counters::default());

        let consumer = {
            let counters = counters.clone();
            tokio::spawn(async move {
                while let Some(task) = rx.recv().await {
                    let counters = counters.clone();
                    tokio::spawn(run_task(task, counters));
                }
                tracing::debug!("background queue closed");
            })
        };

        (Self { tx, counters }, consumer)
    }

    /// Enqueue `f`. It is called once per attempt with the 1-based attempt
    /// number. Returns false if the task was dropped.
    pub fn submit<F, Fut>(&self, name: &'static str, policy: RetryPolicy, mut f: F) -> bool
    where
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task = BackgroundTask {
            name,
            policy,
            run: Box::new(move |attempt| Box::pin(f(attempt))),
        };
        match self.tx.try_send(task) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(task = name, error = %e, "background task dropped");
                false
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_task(mut task: BackgroundTask, counters: Arc<Counters>) {
    let name = task.name;
    let outcome = retry(&task.policy, |_| Verdict::Retry, |attempt| (task.run)(attempt)).await;
    match outcome {
        Ok(()) => {
            counters.succeeded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(task = name, "background task succeeded");
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(task = name, error = %e, "background task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    async fn settle(queue: &BackgroundQueue, done: impl Fn(&QueueStats) -> bool) -> QueueStats {
        for _ in 0..200 {
            let stats = queue.stats();
            if done(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.stats()
    }

    #[tokio::test]
    async fn retries_until_success() {
        let (queue, _consumer) = BackgroundQueue::start(8);
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        assert!(queue.submit("flaky", RetryPolicy::fixed(5, Duration::from_millis(1)), move |attempt| {
            c.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    anyhow::bail!("not yet");
                }
                Ok(())
            }
        }));

        let stats = settle(&queue, |s| s.succeeded == 1).await;
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_task_is_counted_as_failed() {
        let (queue, _consumer) = BackgroundQueue::start(8);
        queue.submit("doomed", RetryPolicy::fixed(2, Duration::from_millis(1)), |_| async {
            anyhow::bail!("always")
        });

        let stats = settle(&queue, |s| s.failed == 1).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.submitted, 1);
    }

    #[tokio::test]
    async fn closed_queue_drops_tasks() {
        let (queue, consumer) = BackgroundQueue::start(1);
        consumer.abort();
        let _ = consumer.await;

        let accepted = queue.submit("late", RetryPolicy::once(), |_| async { Ok(()) });
        assert!(!accepted);
        assert_eq!(queue.stats().dropped, 1);
    }
}
