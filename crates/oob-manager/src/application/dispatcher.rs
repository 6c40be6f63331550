//! TaskDispatcher: runs one board operation as a bounded, retryable task.
//!
//! # Life of a task (for beginners)
//!
//! ```text
//!  Pending ──► Running ──► Succeeded
//!                 │
//!                 ├──► Failed(Retryable) ── attempts left? ── backoff ──► Running
//!                 ├──► Failed(Busy)      (surfaced, never retried here)
//!                 └──► Failed(Fatal)     (surfaced)
//! ```
//!
//! Each attempt:
//!
//! 1. looks up the node,
//! 2. acquires a [`ConcurrencySlot`](crate::application::gate::ConcurrencySlot)
//!    from the node's gate,
//! 3. resolves the node's plugin through the [`BoardServiceRegistry`],
//! 4. checks the plugin declares the operation,
//! 5. invokes the bound operation with a fresh [`NodeContext`],
//! 6. releases the slot (also on error, panic unwind or cancellation),
//! 7. classifies the result into an [`Outcome`].
//!
//! Only [`Outcome::Retryable`] leads to another attempt, and only while the
//! task's [`RetryPolicy`] has attempts left.  Backoff waits run on the node's
//! scheduler so that deregistering the node interrupts them.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use oob_core::{ErrorClass, ManagementError, NodeId, Operation};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::board_service::{not_supported, BoardReply, BoardRequest, BoardService};
use crate::application::context::{NodeContext, OperationContext};
use crate::application::gate::ConcurrencyGate;
use crate::application::manage_nodes::NodeRegistry;
use crate::application::registry::BoardServiceRegistry;

// ── Retry policy ──────────────────────────────────────────────────────────────

/// Attempt budget and exponential backoff between retryable failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.  Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied for every further retry.
    pub backoff_factor: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.max(1.0).powi(retry as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

// ── Task bookkeeping ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed(ErrorClass),
}

/// Descriptor of one logical operation.  Created per call, dropped when the
/// task reaches a terminal state.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub node_id: NodeId,
    pub operation: Operation,
    /// Attempts started so far.
    pub attempt: u32,
    pub policy: RetryPolicy,
    pub state: TaskState,
}

impl Task {
    fn new(id: Uuid, node_id: NodeId, operation: Operation, policy: RetryPolicy) -> Self {
        Self {
            id,
            node_id,
            operation,
            attempt: 0,
            policy,
            state: TaskState::Pending,
        }
    }

    fn has_attempts_left(&self) -> bool {
        self.attempt < self.policy.attempts()
    }
}

/// Tagged result of one attempt.
#[derive(Debug)]
pub enum Outcome<T> {
    Succeeded(T),
    Retryable(ManagementError),
    Busy(ManagementError),
    Fatal(ManagementError),
}

impl<T> Outcome<T> {
    /// Sorts a plugin result by [`ManagementError::class`].
    pub fn classify(result: Result<T, ManagementError>) -> Self {
        match result {
            Ok(value) => Outcome::Succeeded(value),
            Err(e) => match e.class() {
                ErrorClass::Retryable => Outcome::Retryable(e),
                ErrorClass::Busy => Outcome::Busy(e),
                ErrorClass::Fatal => Outcome::Fatal(e),
            },
        }
    }
}

/// Terminal failure of a task, carrying its classification.
#[derive(Debug, Error)]
#[error("task {task_id} ({operation} on node {node_id}) failed after {attempts} attempt(s): {source}")]
pub struct DispatchError {
    pub task_id: Uuid,
    pub node_id: NodeId,
    pub operation: Operation,
    pub attempts: u32,
    pub class: ErrorClass,
    #[source]
    pub source: ManagementError,
}

impl DispatchError {
    pub fn is_busy(&self) -> bool {
        self.class == ErrorClass::Busy
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// Executes board operations under the per-node gate with bounded retry.
pub struct TaskDispatcher {
    nodes: Arc<NodeRegistry>,
    registry: Arc<BoardServiceRegistry>,
    gate: Arc<ConcurrencyGate>,
    policy: RetryPolicy,
}

impl TaskDispatcher {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        registry: Arc<BoardServiceRegistry>,
        gate: Arc<ConcurrencyGate>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            nodes,
            registry,
            gate,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// Runs `request` on `node_id` with the dispatcher's default policy.
    pub async fn dispatch(
        &self,
        node_id: &NodeId,
        request: BoardRequest,
    ) -> Result<BoardReply, DispatchError> {
        let request = Arc::new(request);
        let operation = request.operation();
        self.execute(node_id, operation, move |service, ctx| {
            let request = Arc::clone(&request);
            Box::pin(async move { request.invoke(service.as_ref(), &ctx).await })
        })
        .await
    }

    /// Runs `call` as a task with the default policy.
    pub async fn execute<T, F>(
        &self,
        node_id: &NodeId,
        operation: Operation,
        call: F,
    ) -> Result<T, DispatchError>
    where
        F: Fn(Arc<dyn BoardService>, NodeContext) -> BoxFuture<'static, Result<T, ManagementError>>,
    {
        let policy = self.policy.clone();
        self.execute_with_policy(node_id, operation, &policy, call).await
    }

    /// Runs `call` as a task with an explicit `policy`.
    pub async fn execute_with_policy<T, F>(
        &self,
        node_id: &NodeId,
        operation: Operation,
        policy: &RetryPolicy,
        call: F,
    ) -> Result<T, DispatchError>
    where
        F: Fn(Arc<dyn BoardService>, NodeContext) -> BoxFuture<'static, Result<T, ManagementError>>,
    {
        let context = OperationContext::new(Uuid::new_v4(), operation);
        self.execute_in(node_id, context, policy, call).await
    }

    /// Runs `call` as a task whose first attempt uses `context`.
    ///
    /// Callers that want a shared correlation id or tags across several
    /// tasks build the context themselves.
    pub async fn execute_in<T, F>(
        &self,
        node_id: &NodeId,
        context: OperationContext,
        policy: &RetryPolicy,
        call: F,
    ) -> Result<T, DispatchError>
    where
        F: Fn(Arc<dyn BoardService>, NodeContext) -> BoxFuture<'static, Result<T, ManagementError>>,
    {
        let mut task = Task::new(context.task_id, node_id.clone(), context.operation, policy.clone());
        let mut context = context;

        loop {
            task.attempt += 1;
            task.state = TaskState::Running;
            context.attempt = task.attempt;
            debug!(
                task_id = %task.id,
                node_id = %task.node_id,
                operation = %task.operation,
                attempt = task.attempt,
                "task attempt started"
            );

            let result = self.attempt(&task.node_id, context.clone(), &call).await;
            let error = match Outcome::classify(result) {
                Outcome::Succeeded(value) => {
                    task.state = TaskState::Succeeded;
                    info!(
                        task_id = %task.id,
                        node_id = %task.node_id,
                        operation = %task.operation,
                        attempt = task.attempt,
                        "task succeeded"
                    );
                    return Ok(value);
                }
                Outcome::Retryable(e) if task.has_attempts_left() => e,
                Outcome::Retryable(e) | Outcome::Busy(e) | Outcome::Fatal(e) => {
                    return Err(self.fail(&mut task, e));
                }
            };

            let delay = task.policy.delay_for_attempt(task.attempt - 1);
            warn!(
                task_id = %task.id,
                node_id = %task.node_id,
                attempt = task.attempt,
                max_attempts = task.policy.attempts(),
                delay = ?delay,
                error = %error,
                "retryable failure, backing off"
            );
            if let Err(interrupted) = self.gate.scheduler(&task.node_id).backoff(delay).await {
                return Err(self.fail(&mut task, interrupted));
            }
        }
    }

    async fn attempt<T, F>(
        &self,
        node_id: &NodeId,
        context: OperationContext,
        call: &F,
    ) -> Result<T, ManagementError>
    where
        F: Fn(Arc<dyn BoardService>, NodeContext) -> BoxFuture<'static, Result<T, ManagementError>>,
    {
        let node = self.nodes.get(node_id).ok_or_else(|| {
            ManagementError::Configuration(format!("node {node_id} is not registered"))
        })?;

        let slot = self.gate.acquire(node_id).await?;
        let service = self.registry.resolve(&node)?;
        if !service.supports(context.operation) {
            return Err(not_supported(service.board_type(), context.operation));
        }

        let result = call(service, NodeContext::new(node, context)).await;
        self.gate.release(slot);
        result
    }

    fn fail(&self, task: &mut Task, source: ManagementError) -> DispatchError {
        let class = source.class();
        task.state = TaskState::Failed(class);
        error!(
            task_id = %task.id,
            node_id = %task.node_id,
            operation = %task.operation,
            attempts = task.attempt,
            class = ?class,
            error = %source,
            "task failed"
        );
        DispatchError {
            task_id: task.id,
            node_id: task.node_id.clone(),
            operation: task.operation,
            attempts: task.attempt,
            class,
            source,
        }
    }
}
