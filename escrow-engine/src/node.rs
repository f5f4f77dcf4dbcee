//! Main Escrow Node - High-level API for the escrow system
//!
//! The node wires the services together and owns the fraud monitor's timers:
//! a task is watched from the moment it is posted until it reaches a terminal
//! state, at which point its timer is cancelled.

use crate::{
    EscrowResult,
    api::{ApiResponse, ApproveResponse, ClaimResponse, MonitorResponse},
    error::EscrowError,
    fraud_monitor::FraudMonitor,
    gateway::{BlockchainGateway, HttpBlockchainGateway, LoggingNotifier, WorkerNotifier},
    key_issuance::KeyIssuer,
    models::{EscrowEvent, Reputation, Task, VaultStatus},
    reputation_ledger::ReputationLedger,
    settings::EngineSettings,
    store::{EscrowStore, InMemoryEscrowStore},
    task_manager::{PostTaskRequest, TaskLifecycleManager},
    vault::VaultManager,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Task information response
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task: Task,
    pub vault_status: VaultStatus,
    pub events: Vec<EscrowEvent>,
    pub employer_reputation: Reputation,
    pub worker_reputation: Reputation,
}

/// Node health status
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub active_timers: usize,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Main escrow node that coordinates all components
pub struct EscrowNode {
    manager: Arc<TaskLifecycleManager>,
    monitor: Arc<FraudMonitor>,
    reputation_ledger: Arc<ReputationLedger>,
}

impl EscrowNode {
    /// Create a node over explicit collaborators
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn BlockchainGateway>,
        notifier: Arc<dyn WorkerNotifier>,
    ) -> EscrowResult<Self> {
        info!("Initializing escrow node");
        settings.validate()?;

        let vault_manager = Arc::new(VaultManager::new(settings.vault)?);
        let key_issuer = Arc::new(KeyIssuer::new(settings.keys)?);
        let reputation_ledger = Arc::new(ReputationLedger::new(settings.reputation));

        let manager = Arc::new(TaskLifecycleManager::new(
            settings.task,
            store,
            vault_manager,
            key_issuer,
            reputation_ledger.clone(),
            gateway.clone(),
            notifier,
        ));
        let monitor = Arc::new(FraudMonitor::new(settings.monitor, manager.clone(), gateway));

        info!("Escrow node initialized");
        Ok(Self {
            manager,
            monitor,
            reputation_ledger,
        })
    }

    /// In-memory store, HTTP gateway and logging notifier
    pub fn from_settings(settings: EngineSettings) -> EscrowResult<Self> {
        let gateway = HttpBlockchainGateway::new(settings.gateway.clone())?;
        Self::new(
            settings,
            Arc::new(InMemoryEscrowStore::new()),
            Arc::new(gateway),
            Arc::new(LoggingNotifier),
        )
    }

    /// Post a task and start watching its burner wallet
    pub async fn post_task(&self, request: PostTaskRequest) -> EscrowResult<Task> {
        let task = self.manager.post_task(request).await?;
        self.monitor.watch(task.id).await;
        Ok(task)
    }

    pub async fn submit_for_approval(&self, task_id: Uuid, worker_id: &str) -> EscrowResult<Task> {
        self.manager.submit_for_approval(task_id, worker_id).await
    }

    /// Employer approval; the task's timer stops once the task is terminal
    pub async fn approve(&self, task_id: Uuid, employer_id: &str) -> ApiResponse<ApproveResponse> {
        let result = self.manager.approve(task_id, employer_id).await;
        if let Err(e) = &result {
            warn!(code = e.code(), "Approval of task {} failed: {}", task_id, e);
        }

        self.stop_if_terminal(task_id).await;
        result.into()
    }

    pub async fn claim(
        &self,
        task_id: Uuid,
        worker_id: &str,
        mzkey: &str,
    ) -> ApiResponse<ClaimResponse> {
        let result = self.manager.claim(task_id, worker_id, mzkey).await;
        if let Err(e) = &result {
            warn!(code = e.code(), "Claim on task {} failed: {}", task_id, e);
        }
        result.into()
    }

    /// On-demand monitor pass, independent of the task's timer
    pub async fn monitor(&self, task_id: Uuid) -> ApiResponse<MonitorResponse> {
        let result = self.monitor.check(task_id).await;

        match &result {
            Ok(outcome) if outcome.is_final() => {
                if let Some(finding) = outcome.as_error() {
                    warn!(code = finding.code(), "{}", finding);
                }
                self.monitor.cancel(task_id).await;
            }
            Ok(_) => {}
            Err(e) => warn!(code = e.code(), "Monitor pass on task {} failed: {}", task_id, e),
        }

        result.into()
    }

    /// Get task information with related data
    pub async fn get_task_info(&self, task_id: Uuid) -> EscrowResult<TaskInfo> {
        let task = self.manager.get_task(task_id).await?;
        let vault_status = self.manager.get_vault_status(task_id).await?;
        let events = self.manager.get_task_events(task_id).await?;
        let employer_reputation = self.reputation_ledger.get_reputation(&task.employer_id).await?;
        let worker_reputation = self.reputation_ledger.get_reputation(&task.worker_id).await?;

        Ok(TaskInfo {
            task,
            vault_status,
            events,
            employer_reputation,
            worker_reputation,
        })
    }

    /// Get reputation information for a user
    pub async fn get_user_reputation(&self, user_id: &str) -> EscrowResult<Reputation> {
        self.reputation_ledger.get_reputation(user_id).await
    }

    pub async fn is_watching(&self, task_id: Uuid) -> bool {
        self.monitor.is_watching(task_id).await
    }

    pub async fn health_check(&self) -> NodeHealth {
        let mut issues = Vec::new();
        if let Err(e) = self.manager.get_task(Uuid::nil()).await {
            if !matches!(e, EscrowError::NotFound(_)) {
                issues.push(format!("Store error: {}", e));
            }
        }

        NodeHealth {
            healthy: issues.is_empty(),
            active_timers: self.monitor.active_timers().await,
            issues,
            timestamp: Utc::now(),
        }
    }

    /// Stop every task timer
    pub async fn shutdown(&self) {
        info!("Shutting down escrow node");
        self.monitor.shutdown().await;
        info!("Escrow node shutdown complete");
    }

    async fn stop_if_terminal(&self, task_id: Uuid) {
        match self.manager.get_task(task_id).await {
            Ok(task) if task.status.is_terminal() => {
                self.monitor.cancel(task_id).await;
            }
            Ok(_) => {}
            Err(e) => warn!("Could not re-read task {}: {}", task_id, e),
        }
    }
}
