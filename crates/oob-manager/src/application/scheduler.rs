//! Per-node scheduler for delayed and periodic work.
//!
//! Each node gets its own [`NodeScheduler`], created together with the
//! node's concurrency limiter and shut down when the node is deregistered.
//! It hosts two kinds of work:
//!
//! - **Backoff waits** – [`NodeScheduler::backoff`] suspends the calling task
//!   for a delay but wakes early with an error when the node is torn down,
//!   so no retry loop outlives its node.
//! - **Background jobs** – one-shot ([`NodeScheduler::schedule_once`]) or
//!   periodic ([`NodeScheduler::schedule_periodic`]) tasks such as keepalive
//!   probes.  All of them are aborted on shutdown.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oob_core::{ManagementError, NodeId};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

struct SchedulerInner {
    node_id: NodeId,
    closed: AtomicBool,
    shutdown: Notify,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to one node's scheduler.
#[derive(Clone)]
pub struct NodeScheduler {
    inner: Arc<SchedulerInner>,
}

impl NodeScheduler {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                node_id,
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
                jobs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Sleeps for `delay`, returning early with `ResourceBusy` if the node is
    /// deregistered meanwhile.
    pub async fn backoff(&self, delay: Duration) -> Result<(), ManagementError> {
        // Register interest before checking the flag so a concurrent
        // shutdown cannot slip between the check and the wait.
        let notified = self.inner.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_shut_down() {
            return Err(self.deregistered());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = notified => Err(self.deregistered()),
        }
    }

    /// Runs `job` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, job: F) -> Result<(), ManagementError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            job.await;
        })
    }

    /// Runs `job` every `period`, first after one full period.
    ///
    /// A run that overruns its period delays the next one instead of
    /// bursting to catch up.
    pub fn schedule_periodic<F, Fut>(&self, period: Duration, mut job: F) -> Result<(), ManagementError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                job().await;
            }
        })
    }

    /// Number of background jobs still running.
    pub fn active_jobs(&self) -> usize {
        let mut jobs = self.inner.jobs.lock();
        jobs.retain(|job| !job.is_finished());
        jobs.len()
    }

    /// Aborts every background job and wakes every pending backoff.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.notify_waiters();
        let jobs: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.jobs.lock());
        debug!(node_id = %self.inner.node_id, jobs = jobs.len(), "scheduler shut down");
        for job in jobs {
            job.abort();
        }
    }

    fn spawn<F>(&self, fut: F) -> Result<(), ManagementError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut jobs = self.inner.jobs.lock();
        // Checked under the lock so shutdown() cannot miss a job.
        if self.is_shut_down() {
            return Err(self.deregistered());
        }
        jobs.retain(|job| !job.is_finished());
        jobs.push(tokio::spawn(fut));
        Ok(())
    }

    fn deregistered(&self) -> ManagementError {
        ManagementError::busy(&self.inner.node_id, "node is being deregistered")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn scheduler() -> NodeScheduler {
        NodeScheduler::new(NodeId::from("N1"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_for_delay() {
        // Arrange
        let sched = scheduler();
        let start = tokio::time::Instant::now();

        // Act
        sched.backoff(Duration::from_secs(5)).await.expect("backoff");

        // Assert
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_interrupted_by_shutdown() {
        // Arrange
        let sched = scheduler();
        let waiter = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.backoff(Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;

        // Act
        sched.shutdown();
        let result = waiter.await.expect("join");

        // Assert
        assert!(matches!(result, Err(ManagementError::ResourceBusy { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_job_runs_each_period() {
        // Arrange
        let sched = scheduler();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);

        // Act
        sched
            .schedule_periodic(Duration::from_secs(10), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .expect("schedule");
        tokio::time::sleep(Duration::from_secs(35)).await;

        // Assert
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(sched.active_jobs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_jobs_and_rejects_new_ones() {
        // Arrange
        let sched = scheduler();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        sched
            .schedule_once(Duration::from_secs(1), async move {
                flag.store(true, Ordering::SeqCst);
            })
            .expect("schedule");

        // Act
        sched.shutdown();
        sched.shutdown();
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Assert
        assert!(!ran.load(Ordering::SeqCst), "aborted job must not run");
        assert!(sched
            .schedule_once(Duration::ZERO, async {})
            .is_err());
    }
}
