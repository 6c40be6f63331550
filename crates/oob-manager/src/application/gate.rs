//! ConcurrencyGate: per-node bounded concurrency with fail-fast queueing.
//!
//! # How the gate works (for beginners)
//!
//! Every node gets a [`tokio::sync::Semaphore`] with `max_concurrent` (K)
//! permits.  An operation must hold a permit, wrapped in a
//! [`ConcurrencySlot`], for its whole duration.  When all K permits are
//! taken, the caller *queues*: it waits for a permit, but
//!
//! - only if fewer than `max_queue_depth` callers are already waiting for
//!   this node (otherwise it fails immediately with `ResourceBusy`), and
//! - only for up to `queue_timeout` (then it fails with `ResourceBusy`).
//!
//! The permit is returned when the slot is dropped, which happens on every
//! exit path of the guarded operation: normal return, error, panic unwind or
//! the future being cancelled.
//!
//! Limiters are created lazily on first use and removed by
//! [`ConcurrencyGate::deregister`].  A deregistered node stays retired until
//! [`ConcurrencyGate::reinstate`]: no limiter is recreated for it, so a
//! caller racing the teardown cannot bring its slots back to life.
//! Isolation is strictly per node: there is no lock shared across nodes on
//! the acquire path once a limiter exists.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oob_core::{ManagementError, NodeId};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::application::scheduler::NodeScheduler;

/// Limits applied to every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// Maximum concurrently executing operations per node (K).
    pub max_concurrent: usize,
    /// Maximum callers waiting for a slot per node; `0` disables queueing.
    pub max_queue_depth: usize,
    /// Longest a queued caller waits before giving up.
    pub queue_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_queue_depth: 4,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-node semaphore, queue counter, metrics and scheduler.
struct NodeLimiter {
    node_id: NodeId,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    scheduler: NodeScheduler,
}

impl NodeLimiter {
    fn new(node_id: NodeId, permits: usize) -> Self {
        Self {
            scheduler: NodeScheduler::new(node_id.clone()),
            node_id,
            semaphore: Arc::new(Semaphore::new(permits)),
            waiting: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

/// A held concurrency permit.  Dropping it releases the permit.
pub struct ConcurrencySlot {
    limiter: Arc<NodeLimiter>,
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencySlot {
    fn new(limiter: Arc<NodeLimiter>, permit: OwnedSemaphorePermit) -> Self {
        let now = limiter.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        limiter.peak.fetch_max(now, Ordering::AcqRel);
        Self {
            limiter,
            _permit: permit,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.limiter.node_id
    }
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.limiter.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ConcurrencySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencySlot")
            .field("node_id", &self.limiter.node_id)
            .finish()
    }
}

/// Decrements the waiting counter when a queued acquire ends for any reason,
/// including cancellation of the acquiring future.
struct QueuePosition<'a>(&'a AtomicUsize);

impl Drop for QueuePosition<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct Limiters {
    active: HashMap<NodeId, Arc<NodeLimiter>>,
    retired: HashSet<NodeId>,
}

/// Per-node concurrency limiter registry.
pub struct ConcurrencyGate {
    config: GateConfig,
    limiters: Mutex<Limiters>,
}

impl ConcurrencyGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config: GateConfig {
                max_concurrent: config.max_concurrent.max(1),
                ..config
            },
            limiters: Mutex::new(Limiters::default()),
        }
    }

    pub fn config(&self) -> GateConfig {
        self.config
    }

    /// Obtains a slot for `node_id`, queueing within the configured bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError::ResourceBusy`] when the queue is full, the
    /// queue wait times out, or the node is deregistered while waiting, and
    /// [`ManagementError::Configuration`] when the node is already
    /// deregistered.
    pub async fn acquire(&self, node_id: &NodeId) -> Result<ConcurrencySlot, ManagementError> {
        let limiter = self.limiter(node_id)?;

        match Arc::clone(&limiter.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(ConcurrencySlot::new(limiter, permit)),
            Err(TryAcquireError::Closed) => {
                return Err(ManagementError::busy(node_id, "node is being deregistered"))
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        let queued = limiter.waiting.fetch_add(1, Ordering::AcqRel);
        let _position = QueuePosition(&limiter.waiting);
        if queued >= self.config.max_queue_depth {
            warn!(
                node_id = %node_id,
                queued,
                max_queue_depth = self.config.max_queue_depth,
                "node queue full, rejecting"
            );
            return Err(ManagementError::busy(
                node_id,
                format!("{queued} operation(s) already queued"),
            ));
        }

        debug!(node_id = %node_id, queued, "waiting for concurrency slot");
        let acquire = Arc::clone(&limiter.semaphore).acquire_owned();
        match tokio::time::timeout(self.config.queue_timeout, acquire).await {
            Ok(Ok(permit)) => Ok(ConcurrencySlot::new(Arc::clone(&limiter), permit)),
            Ok(Err(_closed)) => Err(ManagementError::busy(node_id, "node is being deregistered")),
            Err(_elapsed) => {
                warn!(node_id = %node_id, timeout = ?self.config.queue_timeout, "queue wait timed out");
                Err(ManagementError::busy(
                    node_id,
                    format!("no slot within {:?}", self.config.queue_timeout),
                ))
            }
        }
    }

    /// Obtains a slot only if one is free right now.  Never queues.
    pub fn try_acquire(&self, node_id: &NodeId) -> Result<ConcurrencySlot, ManagementError> {
        let limiter = self.limiter(node_id)?;
        Arc::clone(&limiter.semaphore)
            .try_acquire_owned()
            .map(|permit| ConcurrencySlot::new(Arc::clone(&limiter), permit))
            .map_err(|_| ManagementError::busy(node_id, "no free slot"))
    }

    /// Releases `slot`.  Equivalent to dropping it.
    pub fn release(&self, slot: ConcurrencySlot) {
        drop(slot);
    }

    /// The scheduler for `node_id`, creating the node's limiter if needed.
    ///
    /// A deregistered node gets a scheduler that is already shut down.
    pub fn scheduler(&self, node_id: &NodeId) -> NodeScheduler {
        match self.limiter(node_id) {
            Ok(limiter) => limiter.scheduler.clone(),
            Err(_) => {
                let scheduler = NodeScheduler::new(node_id.clone());
                scheduler.shutdown();
                scheduler
            }
        }
    }

    /// Operations currently holding a slot on `node_id`.
    pub fn in_flight(&self, node_id: &NodeId) -> usize {
        self.limiters
            .lock()
            .active
            .get(node_id)
            .map_or(0, |l| l.in_flight.load(Ordering::Acquire))
    }

    /// Highest `in_flight` ever observed on `node_id`.
    pub fn peak_in_flight(&self, node_id: &NodeId) -> usize {
        self.limiters
            .lock()
            .active
            .get(node_id)
            .map_or(0, |l| l.peak.load(Ordering::Acquire))
    }

    /// Callers currently queued on `node_id`.
    pub fn queued(&self, node_id: &NodeId) -> usize {
        self.limiters
            .lock()
            .active
            .get(node_id)
            .map_or(0, |l| l.waiting.load(Ordering::Acquire))
    }

    pub fn is_registered(&self, node_id: &NodeId) -> bool {
        self.limiters.lock().active.contains_key(node_id)
    }

    /// Tears down the node's limiter and scheduler and retires the node.
    ///
    /// Queued callers fail with `ResourceBusy`; operations already holding a
    /// slot run to completion.  Later acquires fail until [`Self::reinstate`].
    pub fn deregister(&self, node_id: &NodeId) {
        let removed = {
            let mut limiters = self.limiters.lock();
            limiters.retired.insert(node_id.clone());
            limiters.active.remove(node_id)
        };
        if let Some(limiter) = removed {
            limiter.semaphore.close();
            limiter.scheduler.shutdown();
            info!(node_id = %node_id, "concurrency gate deregistered node");
        }
    }

    /// Lets a previously deregistered node get a limiter again.
    pub fn reinstate(&self, node_id: &NodeId) {
        if self.limiters.lock().retired.remove(node_id) {
            debug!(node_id = %node_id, "node reinstated in concurrency gate");
        }
    }

    /// Deregisters every node.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<NodeLimiter>> = {
            let mut limiters = self.limiters.lock();
            let Limiters { active, retired } = &mut *limiters;
            active
                .drain()
                .map(|(node_id, limiter)| {
                    retired.insert(node_id);
                    limiter
                })
                .collect()
        };
        for limiter in drained {
            limiter.semaphore.close();
            limiter.scheduler.shutdown();
        }
    }

    fn limiter(&self, node_id: &NodeId) -> Result<Arc<NodeLimiter>, ManagementError> {
        let mut limiters = self.limiters.lock();
        if limiters.retired.contains(node_id) {
            return Err(ManagementError::Configuration(format!(
                "node {node_id} is deregistered"
            )));
        }
        Ok(Arc::clone(limiters.active.entry(node_id.clone()).or_insert_with(|| {
            debug!(node_id = %node_id, permits = self.config.max_concurrent, "creating node limiter");
            Arc::new(NodeLimiter::new(node_id.clone(), self.config.max_concurrent))
        })))
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}
