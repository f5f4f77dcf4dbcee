//! Core data models for the escrow system
//!
//! Task and vault state machines, the reputation record, the audit event,
//! and the balance type returned by the blockchain gateway.

use crate::{EscrowResult, error::EscrowError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Sompi per KAS
pub const SOMPI_PER_KAS: u64 = 100_000_000;

/// Task state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Posted, worker still on the job
    Pending,
    /// Worker submitted, waiting on the employer
    AwaitingApproval,
    /// Employer approved, unlock key issued
    Completed,
    /// Escrow abandoned because the burner wallet was drained
    Voided,
}

impl TaskStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Voided)
    }

    /// Check if this state allows the worker to submit for approval
    pub fn can_submit(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Check if this state allows approval
    pub fn can_approve(&self) -> bool {
        matches!(self, Self::AwaitingApproval)
    }

    /// Check if this state allows claiming the vault
    pub fn can_claim(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Voided => "voided",
        }
    }

    /// Validate a state transition
    pub fn validate_transition(&self, to: TaskStatus) -> EscrowResult<()> {
        let valid = matches!(
            (self, to),
            (Self::Pending, Self::AwaitingApproval)
                | (Self::Pending, Self::Voided)
                | (Self::AwaitingApproval, Self::Completed)
                | (Self::AwaitingApproval, Self::Voided)
        );

        if valid {
            Ok(())
        } else {
            Err(EscrowError::invalid_state(
                self.as_str(),
                to.as_str(),
                "Invalid task state transition",
            ))
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vault lock state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultStatus {
    Locked,
    Unlocked,
    Claimed,
}

impl VaultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::Claimed => "claimed",
        }
    }
}

impl fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task model representing an escrowed gig
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,

    // Parties
    pub employer_id: String,
    pub worker_id: String,

    // Escrow
    pub tip_amount: Decimal,
    pub burner_wallet_address: String,
    pub status: TaskStatus,

    // Unlock key
    pub mzkey: Option<String>,
    pub mzkey_expires: Option<DateTime<Utc>>,
    pub pera_secret_key_granted: bool,
    pub funds_claimed: bool,

    // Balance reconciliation
    pub balance_verified: bool,
    pub last_balance_check: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task in the pending state
    pub fn new(
        employer_id: String,
        worker_id: String,
        tip_amount: Decimal,
        burner_wallet_address: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            employer_id,
            worker_id,
            tip_amount,
            burner_wallet_address,
            status: TaskStatus::Pending,
            mzkey: None,
            mzkey_expires: None,
            pera_secret_key_granted: false,
            funds_claimed: false,
            balance_verified: false,
            last_balance_check: None,
            void_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, rejecting anything the state machine does not allow
    pub fn transition(&mut self, to: TaskStatus) -> EscrowResult<()> {
        self.status.validate_transition(to)?;
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Void the task, recording why
    pub fn void(&mut self, reason: &str, checked_at: DateTime<Utc>) -> EscrowResult<()> {
        self.transition(TaskStatus::Voided)?;
        self.void_reason = Some(reason.to_string());
        self.balance_verified = false;
        self.last_balance_check = Some(checked_at);
        Ok(())
    }
}

/// Vault holding the sealed seed phrase of a task's burner wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub id: Uuid,
    pub task_id: Uuid,
    pub encrypted_seed_phrase: String,
    pub pera_secret_key: String,
    pub status: VaultStatus,
    pub claimed_by: Option<String>,
    pub unlock_timestamp: Option<DateTime<Utc>>,
}

/// Task and vault persisted as one aggregate under a shared version counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub vault: Vault,
    pub version: u64,
}

/// Reputation model for user scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reputation {
    pub user_id: String,
    /// Always within [0, 10]
    pub reputation_score: f64,
    pub trades_completed: u32,
    pub updated_at: DateTime<Utc>,
}

impl Reputation {
    /// Create new reputation entry
    pub fn new(user_id: String, initial_score: f64) -> Self {
        Self {
            user_id,
            reputation_score: initial_score,
            trades_completed: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Escrow event for audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowEvent {
    pub id: Uuid,
    pub event_type: String,
    pub task_id: Uuid,
    pub actor: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl EscrowEvent {
    pub fn new(
        event_type: &str,
        task_id: Uuid,
        actor: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            task_id,
            actor,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Burner wallet balance as reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub sompi: u64,
}

impl Balance {
    pub fn from_sompi(sompi: u64) -> Self {
        Self { sompi }
    }

    /// Convert a KAS amount, truncating anything below one sompi
    pub fn from_kas(kas: Decimal) -> Self {
        let sompi = (kas * Decimal::from(SOMPI_PER_KAS))
            .trunc()
            .to_u64()
            .unwrap_or(0);
        Self { sompi }
    }

    pub fn to_kas(self) -> Decimal {
        Decimal::from_i128_with_scale(i128::from(self.sompi), 8).normalize()
    }

    /// Whether this balance still covers `expected` KAS
    pub fn covers(self, expected: Decimal) -> bool {
        self.to_kas() >= expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            "employer".to_string(),
            "worker".to_string(),
            Decimal::from(100),
            "kaspa:qburner".to_string(),
        )
    }

    #[test]
    fn test_forward_transitions() {
        let mut task = task();
        assert_eq!(task.status, TaskStatus::Pending);
        task.transition(TaskStatus::AwaitingApproval).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.status.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_never_left() {
        for terminal in [TaskStatus::Completed, TaskStatus::Voided] {
            for to in [
                TaskStatus::Pending,
                TaskStatus::AwaitingApproval,
                TaskStatus::Completed,
                TaskStatus::Voided,
            ] {
                assert!(terminal.validate_transition(to).is_err());
            }
        }
    }

    #[test]
    fn test_monitor_void_allowed_before_submission() {
        let mut task = task();
        task.void("drained before submission", Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Voided);

        let back = TaskStatus::AwaitingApproval.validate_transition(TaskStatus::Pending);
        assert!(back.is_err());
        assert!(TaskStatus::Pending.validate_transition(TaskStatus::Pending).is_err());
    }

    #[test]
    fn test_pending_cannot_skip_to_completed() {
        let mut task = task();
        let err = task.transition(TaskStatus::Completed).unwrap_err();
        assert_eq!(err.code(), "invalid_state");
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_void_records_reason() {
        let mut task = task();
        task.transition(TaskStatus::AwaitingApproval).unwrap();
        task.void("drained", Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Voided);
        assert_eq!(task.void_reason.as_deref(), Some("drained"));
        assert!(!task.balance_verified);
        assert!(task.last_balance_check.is_some());
    }

    #[test]
    fn test_balance_conversion() {
        let balance = Balance::from_sompi(30 * SOMPI_PER_KAS);
        assert_eq!(balance.to_kas(), Decimal::from(30));
        assert!(balance.covers(Decimal::from(30)));
        assert!(!balance.covers(Decimal::new(3000000001, 8)));
        assert_eq!(Balance::from_kas(Decimal::new(15, 1)).sompi, 150_000_000);
    }
}
