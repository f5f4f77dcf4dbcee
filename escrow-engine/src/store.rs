//! Persistence port for the task/vault aggregate
//!
//! Every status-changing write goes through [`EscrowStore::compare_and_swap`],
//! which only lands when the stored version still equals the version the
//! writer read. Losers get [`CasOutcome::Stale`] and must re-read.

use crate::{
    EscrowResult,
    error::EscrowError,
    models::{EscrowEvent, TaskRecord},
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Result of a conditional write
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// Write landed; carries the record as now stored
    Applied(TaskRecord),
    /// Another writer got there first
    Stale,
}

/// Task/vault persistence contract
#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Store a freshly posted task together with its vault
    async fn insert(&self, record: TaskRecord) -> EscrowResult<()>;

    /// Load the aggregate for a task
    async fn load(&self, task_id: Uuid) -> EscrowResult<Option<TaskRecord>>;

    /// Replace the aggregate iff its version is still `expected_version`.
    /// The stored version becomes `expected_version + 1`.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: TaskRecord,
    ) -> EscrowResult<CasOutcome>;

    /// Append to the audit trail
    async fn append_event(&self, event: EscrowEvent) -> EscrowResult<()>;

    /// Audit trail for one task, oldest first
    async fn events_for(&self, task_id: Uuid) -> EscrowResult<Vec<EscrowEvent>>;
}

/// In-memory store for local runs and tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryEscrowStore {
    records: Arc<RwLock<HashMap<Uuid, TaskRecord>>>,
    events: Arc<RwLock<Vec<EscrowEvent>>>,
}

impl InMemoryEscrowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_aggregate(record: &TaskRecord) -> EscrowResult<()> {
    if record.task.id != record.vault.task_id {
        return Err(EscrowError::internal(format!(
            "Vault {} belongs to task {}, not {}",
            record.vault.id, record.vault.task_id, record.task.id
        )));
    }
    Ok(())
}

#[async_trait]
impl EscrowStore for InMemoryEscrowStore {
    async fn insert(&self, record: TaskRecord) -> EscrowResult<()> {
        check_aggregate(&record)?;

        let mut records = self.records.write().await;
        if records.contains_key(&record.task.id) {
            return Err(EscrowError::validation(format!(
                "Task {} already exists",
                record.task.id
            )));
        }
        records.insert(record.task.id, record);
        Ok(())
    }

    async fn load(&self, task_id: Uuid) -> EscrowResult<Option<TaskRecord>> {
        Ok(self.records.read().await.get(&task_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        mut next: TaskRecord,
    ) -> EscrowResult<CasOutcome> {
        check_aggregate(&next)?;

        let mut records = self.records.write().await;
        let current = records
            .get_mut(&next.task.id)
            .ok_or(EscrowError::NotFound(next.task.id))?;

        if current.version != expected_version {
            return Ok(CasOutcome::Stale);
        }

        next.version = expected_version + 1;
        *current = next.clone();
        Ok(CasOutcome::Applied(next))
    }

    async fn append_event(&self, event: EscrowEvent) -> EscrowResult<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn events_for(&self, task_id: Uuid) -> EscrowResult<Vec<EscrowEvent>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|event| event.task_id == task_id)
            .cloned()
            .collect())
    }
}
