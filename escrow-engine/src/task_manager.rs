//! Task Manager - Coordinates task lifecycle and state transitions
//!
//! The lifecycle manager is the only writer of task and vault state. Every
//! write is a read-modify-CAS cycle against the aggregate's version: when a
//! concurrent writer wins, the loser re-reads and re-checks its
//! preconditions from scratch. Reputation changes and notifications happen
//! only after the winning write, so they fire once per transition.

use crate::{
    EscrowResult,
    error::EscrowError,
    gateway::{BlockchainGateway, WorkerNotifier, balance_within},
    key_issuance::{KeyIssuer, MzKey},
    models::{Balance, EscrowEvent, Task, TaskRecord, TaskStatus, VaultStatus},
    reputation_ledger::ReputationLedger,
    store::{CasOutcome, EscrowStore},
    vault::VaultManager,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const APPROVAL_VOID_REASON: &str = "funds withdrawn before approval";
pub const MONITOR_VOID_REASON: &str = "Employer withdrew funds from burner wallet";

/// Configuration for the task manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Re-read/re-apply attempts after losing a version race
    pub max_cas_retries: u32,
    /// Deadline for the approval-time balance query in seconds
    pub balance_timeout_secs: u64,
    /// Employer score bonus on approval
    pub employer_approval_delta: f64,
    /// Worker score bonus on approval
    pub worker_approval_delta: f64,
    /// Employer score penalty when escrow is voided for missing funds
    pub fraud_penalty: f64,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: 5,
            balance_timeout_secs: 8,
            employer_approval_delta: 0.5,
            worker_approval_delta: 1.0,
            fraud_penalty: 10.0,
        }
    }
}

/// Task posting request
#[derive(Debug, Clone)]
pub struct PostTaskRequest {
    pub employer_id: String,
    pub worker_id: String,
    pub tip_amount: Decimal,
    pub burner_wallet_address: String,
    pub seed_phrase: String,
    pub pera_secret_key: String,
}

/// Result of a successful approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalReceipt {
    pub task_id: Uuid,
    pub mzkey: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a successful claim. Only ever produced once per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimReceipt {
    pub task_id: Uuid,
    pub seed_phrase: String,
    pub wallet_address: String,
    pub amount: Decimal,
}

/// What a balance reconciliation did to the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceCheck {
    /// Task already terminal, nothing written
    Skipped(TaskStatus),
    /// Funds still cover the tip
    Verified,
    /// Funds gone, task voided by this call
    FraudDetected,
}

/// Task lifecycle orchestration
pub struct TaskLifecycleManager {
    config: TaskManagerConfig,
    store: Arc<dyn EscrowStore>,
    vault_manager: Arc<VaultManager>,
    key_issuer: Arc<KeyIssuer>,
    reputation_ledger: Arc<ReputationLedger>,
    gateway: Arc<dyn BlockchainGateway>,
    notifier: Arc<dyn WorkerNotifier>,
}

impl TaskLifecycleManager {
    /// Create a new task lifecycle manager
    pub fn new(
        config: TaskManagerConfig,
        store: Arc<dyn EscrowStore>,
        vault_manager: Arc<VaultManager>,
        key_issuer: Arc<KeyIssuer>,
        reputation_ledger: Arc<ReputationLedger>,
        gateway: Arc<dyn BlockchainGateway>,
        notifier: Arc<dyn WorkerNotifier>,
    ) -> Self {
        Self {
            config,
            store,
            vault_manager,
            key_issuer,
            reputation_ledger,
            gateway,
            notifier,
        }
    }

    /// Create a task and its locked vault together
    pub async fn post_task(&self, request: PostTaskRequest) -> EscrowResult<Task> {
        self.validate_post_task_request(&request)?;

        let task = Task::new(
            request.employer_id,
            request.worker_id,
            request.tip_amount,
            request.burner_wallet_address,
        );
        let vault = self
            .vault_manager
            .lock(task.id, &request.seed_phrase, &request.pera_secret_key)?;

        self.store
            .insert(TaskRecord {
                task: task.clone(),
                vault,
                version: 0,
            })
            .await?;

        self.record_event(
            "task.posted",
            task.id,
            Some(task.employer_id.clone()),
            Some(serde_json::json!({
                "tip_amount": task.tip_amount,
                "burner_wallet_address": task.burner_wallet_address,
            })),
        )
        .await?;

        info!("Posted task {} ({} KAS)", task.id, task.tip_amount);
        Ok(task)
    }

    /// Worker hands the task over for approval: pending -> awaiting_approval
    pub async fn submit_for_approval(&self, task_id: Uuid, actor: &str) -> EscrowResult<Task> {
        let record = self
            .mutate(task_id, |record| {
                ensure_actor(actor, &record.task.worker_id, "Only the assigned worker can submit")?;
                if !record.task.status.can_submit() {
                    return Err(precondition(&record.task, TaskStatus::AwaitingApproval));
                }
                record.task.transition(TaskStatus::AwaitingApproval)?;
                Ok(Some(()))
            })
            .await?
            .map(|(record, _)| record)
            .ok_or_else(|| EscrowError::internal("Submission produced no write"))?;

        self.record_event("task.submitted", task_id, Some(actor.to_string()), None)
            .await?;

        info!("Task {} awaiting approval", task_id);
        Ok(record.task)
    }

    /// Employer approval: verify escrow, mint the unlock key, open the vault
    pub async fn approve(&self, task_id: Uuid, actor: &str) -> EscrowResult<ApprovalReceipt> {
        info!("Approving task {}", task_id);

        let task = self.get_task(task_id).await?;
        self.validate_approval(&task, actor)?;

        // A timeout here leaves the task untouched
        let balance = balance_within(
            self.gateway.as_ref(),
            &task.burner_wallet_address,
            Duration::from_secs(self.config.balance_timeout_secs),
        )
        .await?;

        if !balance.covers(task.tip_amount) {
            return Err(self.void_at_approval(task_id, actor, balance).await);
        }

        let key = self.key_issuer.generate_mzkey()?;
        let checked_at = Utc::now();
        let (record, _) = self
            .mutate(task_id, |record| {
                self.validate_approval(&record.task, actor)?;
                record.vault.unlock()?;
                record.task.transition(TaskStatus::Completed)?;
                record.task.mzkey = Some(key.key.clone());
                record.task.mzkey_expires = Some(key.expires_at);
                record.task.pera_secret_key_granted = true;
                record.task.balance_verified = true;
                record.task.last_balance_check = Some(checked_at);
                Ok(Some(()))
            })
            .await?
            .ok_or_else(|| EscrowError::internal("Approval produced no write"))?;

        let task = &record.task;
        self.reputation_ledger
            .adjust(&task.employer_id, self.config.employer_approval_delta)
            .await?;
        self.reputation_ledger
            .adjust(&task.worker_id, self.config.worker_approval_delta)
            .await?;
        self.reputation_ledger
            .increment_trades(&task.worker_id)
            .await?;

        self.record_event(
            "task.approved",
            task_id,
            Some(actor.to_string()),
            Some(serde_json::json!({
                "mzkey_expires": key.expires_at,
                "balance_sompi": balance.sompi,
            })),
        )
        .await?;

        info!("Approved task {}; unlock key valid until {}", task_id, key.expires_at);

        let MzKey { key, expires_at } = key;
        Ok(ApprovalReceipt {
            task_id,
            mzkey: key,
            expires_at,
        })
    }

    /// Worker claim: trade a valid unlock key for the seed phrase, once
    pub async fn claim(
        &self,
        task_id: Uuid,
        actor: &str,
        supplied_key: &str,
    ) -> EscrowResult<ClaimReceipt> {
        info!("Claim attempt on task {}", task_id);

        let record = self.load_record(task_id).await?;
        self.validate_claim(&record, actor, supplied_key)?;

        // Open before writing so a broken vault leaves state unchanged
        let seed_phrase = self.vault_manager.decode(
            &record.vault.encrypted_seed_phrase,
            &record.vault.pera_secret_key,
            task_id,
        )?;

        let claimed_at = Utc::now();
        let (record, _) = self
            .mutate(task_id, |record| {
                self.validate_claim(record, actor, supplied_key)?;
                record.vault.mark_claimed(actor, claimed_at)?;
                record.task.funds_claimed = true;
                record.task.updated_at = claimed_at;
                Ok(Some(()))
            })
            .await?
            .ok_or_else(|| EscrowError::internal("Claim produced no write"))?;

        self.record_event("funds.claimed", task_id, Some(actor.to_string()), None)
            .await?;

        info!("Funds for task {} claimed by {}", task_id, actor);

        Ok(ClaimReceipt {
            task_id,
            seed_phrase,
            wallet_address: record.task.burner_wallet_address,
            amount: record.task.tip_amount,
        })
    }

    /// Reconcile an observed burner-wallet balance against the task's tip.
    ///
    /// Terminal tasks are left alone, so repeated calls after a void are
    /// no-ops and a call racing a successful approval cannot void it.
    pub async fn record_balance_check(
        &self,
        task_id: Uuid,
        balance: Balance,
    ) -> EscrowResult<BalanceCheck> {
        let checked_at = Utc::now();
        let result = self
            .mutate(task_id, |record| {
                if record.task.status.is_terminal() {
                    return Ok(None);
                }

                if balance.covers(record.task.tip_amount) {
                    record.task.balance_verified = true;
                    record.task.last_balance_check = Some(checked_at);
                    Ok(Some(BalanceCheck::Verified))
                } else {
                    record.task.void(MONITOR_VOID_REASON, checked_at)?;
                    Ok(Some(BalanceCheck::FraudDetected))
                }
            })
            .await?;

        let Some((record, outcome)) = result else {
            let task = self.get_task(task_id).await?;
            debug!("Balance check skipped for task {} ({})", task_id, task.status);
            return Ok(BalanceCheck::Skipped(task.status));
        };

        if outcome == BalanceCheck::FraudDetected {
            warn!(
                "Fraud on task {}: burner wallet holds {} KAS, expected {}",
                task_id,
                balance.to_kas(),
                record.task.tip_amount
            );
            self.after_void(&record.task, None, MONITOR_VOID_REASON, balance)
                .await?;
        }

        Ok(outcome)
    }

    /// Get a task by ID
    pub async fn get_task(&self, task_id: Uuid) -> EscrowResult<Task> {
        Ok(self.load_record(task_id).await?.task)
    }

    /// Get the vault status for a task
    pub async fn get_vault_status(&self, task_id: Uuid) -> EscrowResult<VaultStatus> {
        Ok(self.load_record(task_id).await?.vault.status)
    }

    /// Get escrow events for a task
    pub async fn get_task_events(&self, task_id: Uuid) -> EscrowResult<Vec<EscrowEvent>> {
        self.store.events_for(task_id).await
    }

    async fn void_at_approval(&self, task_id: Uuid, actor: &str, balance: Balance) -> EscrowError {
        let checked_at = Utc::now();
        let result = self
            .mutate(task_id, |record| {
                self.validate_approval(&record.task, actor)?;
                record.task.void(APPROVAL_VOID_REASON, checked_at)?;
                Ok(Some(()))
            })
            .await;

        let record = match result {
            Ok(Some((record, _))) => record,
            Ok(None) => return EscrowError::internal("Approval void produced no write"),
            Err(e) => return e,
        };

        warn!(
            "Task {} voided at approval: burner wallet holds {} KAS, expected {}",
            task_id,
            balance.to_kas(),
            record.task.tip_amount
        );

        if let Err(e) = self
            .after_void(&record.task, Some(actor.to_string()), APPROVAL_VOID_REASON, balance)
            .await
        {
            return e;
        }

        EscrowError::insufficient_funds(record.task.tip_amount, balance.to_kas())
    }

    /// Side effects of a void that won its write
    async fn after_void(
        &self,
        task: &Task,
        actor: Option<String>,
        reason: &str,
        balance: Balance,
    ) -> EscrowResult<()> {
        self.reputation_ledger
            .adjust(&task.employer_id, -self.config.fraud_penalty)
            .await?;

        self.record_event(
            "task.voided",
            task.id,
            actor,
            Some(serde_json::json!({
                "reason": reason,
                "expected": task.tip_amount,
                "balance_sompi": balance.sompi,
            })),
        )
        .await?;

        // Delivery is best effort; the void stands either way
        if let Err(e) = self.notifier.notify_worker(task.id, reason).await {
            warn!("Failed to notify worker of task {}: {}", task.id, e);
        }

        Ok(())
    }

    /// Read-modify-CAS loop. `apply` sees a fresh copy of the aggregate on
    /// every attempt; returning `Ok(None)` means there is nothing to write.
    async fn mutate<T, F>(
        &self,
        task_id: Uuid,
        mut apply: F,
    ) -> EscrowResult<Option<(TaskRecord, T)>>
    where
        F: FnMut(&mut TaskRecord) -> EscrowResult<Option<T>>,
    {
        for attempt in 0..=self.config.max_cas_retries {
            let current = self.load_record(task_id).await?;
            let mut next = current.clone();

            let Some(value) = apply(&mut next)? else {
                return Ok(None);
            };

            match self.store.compare_and_swap(current.version, next).await? {
                CasOutcome::Applied(stored) => return Ok(Some((stored, value))),
                CasOutcome::Stale => {
                    debug!(
                        "Lost version race on task {} (attempt {}), retrying",
                        task_id,
                        attempt + 1
                    );
                }
            }
        }

        warn!("Giving up on task {} after repeated write conflicts", task_id);
        Err(EscrowError::Conflict(task_id))
    }

    async fn load_record(&self, task_id: Uuid) -> EscrowResult<TaskRecord> {
        self.store
            .load(task_id)
            .await?
            .ok_or(EscrowError::NotFound(task_id))
    }

    async fn record_event(
        &self,
        event_type: &str,
        task_id: Uuid,
        actor: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> EscrowResult<()> {
        self.store
            .append_event(EscrowEvent::new(event_type, task_id, actor, metadata))
            .await
    }

    /// Validate task posting request
    fn validate_post_task_request(&self, request: &PostTaskRequest) -> EscrowResult<()> {
        if request.employer_id.trim().is_empty() {
            return Err(EscrowError::validation("Employer id cannot be empty"));
        }

        if request.worker_id.trim().is_empty() {
            return Err(EscrowError::validation("Worker id cannot be empty"));
        }

        if request.employer_id == request.worker_id {
            return Err(EscrowError::validation("Employer and worker must differ"));
        }

        if request.tip_amount <= Decimal::ZERO {
            return Err(EscrowError::validation("Tip amount must be greater than 0"));
        }

        if request.burner_wallet_address.trim().is_empty() {
            return Err(EscrowError::validation("Burner wallet address cannot be empty"));
        }

        if request.seed_phrase.trim().is_empty() {
            return Err(EscrowError::validation("Seed phrase cannot be empty"));
        }

        if request.pera_secret_key.trim().is_empty() {
            return Err(EscrowError::validation("Pera secret key cannot be empty"));
        }

        Ok(())
    }

    /// Validate approval preconditions
    fn validate_approval(&self, task: &Task, actor: &str) -> EscrowResult<()> {
        ensure_actor(actor, &task.employer_id, "Only the task employer can approve")?;

        if !task.status.can_approve() {
            return Err(precondition(task, TaskStatus::Completed));
        }

        Ok(())
    }

    /// Validate claim preconditions, in the order callers observe failures
    fn validate_claim(
        &self,
        record: &TaskRecord,
        actor: &str,
        supplied_key: &str,
    ) -> EscrowResult<()> {
        let task = &record.task;
        ensure_actor(actor, &task.worker_id, "Only the assigned worker can claim")?;

        if !task.status.can_claim() {
            return Err(EscrowError::invalid_state(
                task.status.as_str(),
                "claimed",
                "Only completed tasks can be claimed",
            ));
        }

        self.key_issuer.validate(task, supplied_key)?;

        if task.funds_claimed {
            return Err(EscrowError::AlreadyClaimed(task.id));
        }

        if record.vault.status != VaultStatus::Unlocked {
            return Err(EscrowError::invalid_state(
                record.vault.status.as_str(),
                VaultStatus::Claimed.as_str(),
                "Vault is not unlocked",
            ));
        }

        Ok(())
    }
}

fn ensure_actor(actor: &str, expected: &str, message: &str) -> EscrowResult<()> {
    if actor != expected {
        return Err(EscrowError::authorization(message));
    }
    Ok(())
}

fn precondition(task: &Task, requested: TaskStatus) -> EscrowError {
    let reason = match &task.void_reason {
        Some(reason) => format!("Task is {} ({})", task.status, reason),
        None => format!("Task is {}", task.status),
    };
    EscrowError::invalid_state(
        task.status.as_str().to_string(),
        requested.as_str().to_string(),
        reason,
    )
}
