//! Workflow state persistence contract and in-memory implementation

use super::state::{WorkflowState, WorkflowStatus};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Keyed persistence of in-flight workflow state
///
/// Backed by cache/DB in production; the store promises no transactionality.
/// Callers that read-modify-write must serialize themselves through
/// [`WorkflowLocks`]. Implementations must tolerate unknown workflow ids by
/// returning `Ok(None)` rather than erroring.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Fetch a workflow by id
    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowState>>;

    /// All non-terminal workflows for a session, most recent activity first
    async fn active_workflows(&self, session_id: &str) -> Result<Vec<WorkflowState>>;

    /// Write the full workflow document (insert or replace)
    async fn put_workflow(&self, workflow: &WorkflowState) -> Result<()>;

    /// Mark a workflow cancelled (terminal); unknown ids are a no-op
    async fn cancel_workflow(&self, workflow_id: &str) -> Result<()>;
}

/// In-memory store keyed by workflow id
///
/// The default backing for tests and embedders without an external store.
/// Session lookups scan the map; expiry is the owner's concern, this store
/// keeps everything until replaced.
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<String, WorkflowState>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored workflows (any status)
    pub async fn len(&self) -> usize {
        self.workflows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workflows.read().await.is_empty()
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowState>> {
        Ok(self.workflows.read().await.get(workflow_id).cloned())
    }

    async fn active_workflows(&self, session_id: &str) -> Result<Vec<WorkflowState>> {
        let workflows = self.workflows.read().await;
        let mut active: Vec<WorkflowState> = workflows
            .values()
            .filter(|w| w.session_id == session_id && !w.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(active)
    }

    async fn put_workflow(&self, workflow: &WorkflowState) -> Result<()> {
        self.workflows
            .write()
            .await
            .insert(workflow.workflow_id.clone(), workflow.clone());
        Ok(())
    }

    async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        let mut workflows = self.workflows.write().await;
        if let Some(workflow) = workflows.get_mut(workflow_id) {
            if !workflow.is_terminal() {
                workflow.status = WorkflowStatus::Cancelled;
                workflow.touch();
            }
        }
        Ok(())
    }
}

/// Advisory single-writer locks keyed by workflow id
///
/// The store itself is last-writer-wins; holding the workflow's lock across a
/// read-mutate-persist sequence prevents the orchestration loop and an
/// incoming interruption from silently losing each other's updates.
#[derive(Clone, Default)]
pub struct WorkflowLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl WorkflowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the single-writer lock for a workflow id
    pub async fn acquire(&self, workflow_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(workflow_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry for a finished workflow
    pub async fn release(&self, workflow_id: &str) {
        self.locks.lock().await.remove(workflow_id);
    }
}
