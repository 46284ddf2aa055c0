//! Periodic maintenance task scheduler.
//!
//! Owns a small set of named periodic jobs (health rollup, timeout reaper,
//! expiry reaper, retention cleanup). Task bodies are plain closures, so
//! tests invoke them directly instead of waiting on wall-clock intervals.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(pub &'static str);

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub interval: Duration,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<RwLock<Inner>>,
}

struct Inner {
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(8);
        Self {
            inner: Arc::new(RwLock::new(Inner { shutdown_tx: tx })),
        }
    }

    /// Spawn a periodic task that runs until `shutdown` is called.
    pub async fn spawn_periodic<F, Fut>(&self, task: ScheduledTask, f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let rx = { self.inner.read().await.shutdown_tx.subscribe() };
        debug!(task = task.id.0, interval_ms = task.interval.as_millis() as u64, "scheduling periodic task");
        tokio::spawn(run_periodic(task, rx, f));
    }

    /// Stop all periodic tasks spawned from this scheduler.
    pub async fn shutdown(&self) {
        let tx = { self.inner.read().await.shutdown_tx.clone() };
        let _ = tx.send(());
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_periodic<F, Fut>(
    task: ScheduledTask,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut f: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut ticker = tokio::time::interval(task.interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                f().await;
            }
            _ = shutdown_rx.recv() => {
                debug!(task = task.id.0, "periodic task stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn periodic_task_runs_and_stops() {
        let sched = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c2 = counter.clone();
        let task = ScheduledTask {
            id: TaskId("test.task"),
            interval: Duration::from_millis(20),
        };
        sched
            .spawn_periodic(task, move || {
                let c = c2.clone();
                async move {
                    c.fetch_add(1, Ordering::Relaxed);
                }
            })
            .await;

        tokio::time::sleep(Duration::from_millis(75)).await;
        sched.shutdown().await;
        let n = counter.load(Ordering::Relaxed);
        assert!(n >= 2, "expected at least 2 ticks, got {}", n);

        // No further ticks after shutdown
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = counter.load(Ordering::Relaxed);
        assert!(after <= n + 1, "task kept running after shutdown");
    }
}
