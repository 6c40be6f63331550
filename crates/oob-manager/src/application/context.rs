//! Explicit per-operation context.
//!
//! Every plugin call receives a [`NodeContext`]: the target node plus an
//! [`OperationContext`] describing which task and which attempt the call
//! belongs to.  Nothing about the current operation is stored in ambient
//! per-thread state; whatever a plugin needs to know for logging or auditing
//! arrives as a parameter.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use oob_core::domain::hardware::Operation;
use oob_core::protocol::{CommandKind, ResponseData};
use oob_core::{ManagementError, Node};
use uuid::Uuid;

/// Identity and bookkeeping for one attempt of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    /// Shared by every task started on behalf of the same external request.
    pub correlation_id: Uuid,
    pub task_id: Uuid,
    pub operation: Operation,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Free-form key/value annotations (caller, ticket number, ...).
    pub tags: BTreeMap<String, String>,
}

impl OperationContext {
    /// Context for the first attempt of a fresh task.
    pub fn new(task_id: Uuid, operation: Operation) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            task_id,
            operation,
            attempt: 1,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// The same task, one attempt later.
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next
    }
}

/// Everything a board plugin is handed for one call.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub node: Arc<Node>,
    pub operation: OperationContext,
}

impl NodeContext {
    pub fn new(node: Arc<Node>, operation: OperationContext) -> Self {
        Self { node, operation }
    }
}

/// Executes one command over a node's management session.
///
/// Implementations hold a session-scoped exclusion for the whole
/// encode → send → decode cycle, so two callers never interleave on one
/// session even when the node's concurrency limit is above one.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn execute(&self, command: CommandKind) -> Result<ResponseData, ManagementError>;
}
