//! Reputation Ledger - scalar score bookkeeping for employers and workers
//!
//! Scores live in [0, 10]; every write clamps. Users appear on first touch
//! with the initial score.

use crate::{EscrowResult, models::Reputation};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Configuration for the reputation ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationLedgerConfig {
    /// Initial reputation score for new users
    pub initial_score: f64,
    /// Minimum reputation score
    pub min_score: f64,
    /// Maximum reputation score
    pub max_score: f64,
}

impl Default for ReputationLedgerConfig {
    fn default() -> Self {
        Self {
            initial_score: 5.0,
            min_score: 0.0,
            max_score: 10.0,
        }
    }
}

/// Main reputation ledger
pub struct ReputationLedger {
    config: ReputationLedgerConfig,
    reputations: Arc<RwLock<HashMap<String, Reputation>>>,
}

impl ReputationLedger {
    /// Create a new reputation ledger
    pub fn new(config: ReputationLedgerConfig) -> Self {
        Self {
            config,
            reputations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get reputation for a user
    pub async fn get_reputation(&self, user_id: &str) -> EscrowResult<Reputation> {
        if let Some(reputation) = self.reputations.read().await.get(user_id) {
            return Ok(reputation.clone());
        }

        Ok(Reputation::new(
            user_id.to_string(),
            self.config.initial_score,
        ))
    }

    /// Apply an update under the write lock, clamping the score afterwards
    pub async fn update_reputation<F>(
        &self,
        user_id: &str,
        update_fn: F,
    ) -> EscrowResult<Reputation>
    where
        F: FnOnce(&mut Reputation) + Send,
    {
        let mut reputations = self.reputations.write().await;
        let initial_score = self.config.initial_score;
        let reputation = reputations
            .entry(user_id.to_string())
            .or_insert_with(|| Reputation::new(user_id.to_string(), initial_score));

        let before = reputation.reputation_score;
        update_fn(reputation);

        if reputation.reputation_score.is_nan() {
            warn!("Discarding NaN score update for {}", user_id);
            reputation.reputation_score = before;
        }
        reputation.reputation_score = reputation
            .reputation_score
            .clamp(self.config.min_score, self.config.max_score);
        reputation.updated_at = Utc::now();

        Ok(reputation.clone())
    }

    /// Add `delta` to the user's score, clamped to the configured bounds
    pub async fn adjust(&self, user_id: &str, delta: f64) -> EscrowResult<Reputation> {
        let reputation = self
            .update_reputation(user_id, |rep| rep.reputation_score += delta)
            .await?;

        info!(
            "Reputation for {} adjusted by {:+} to {:.2}",
            user_id, delta, reputation.reputation_score
        );
        Ok(reputation)
    }

    /// Count one more completed trade
    pub async fn increment_trades(&self, user_id: &str) -> EscrowResult<Reputation> {
        self.update_reputation(user_id, |rep| {
            rep.trades_completed = rep.trades_completed.saturating_add(1);
        })
        .await
    }
}

impl Default for ReputationLedger {
    fn default() -> Self {
        Self::new(ReputationLedgerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_user_starts_at_initial_score() {
        let ledger = ReputationLedger::default();
        let reputation = ledger.get_reputation("alice").await.unwrap();

        assert_eq!(reputation.user_id, "alice");
        assert_eq!(reputation.reputation_score, 5.0);
        assert_eq!(reputation.trades_completed, 0);
    }

    #[tokio::test]
    async fn test_adjust() {
        let ledger = ReputationLedger::default();

        assert_eq!(ledger.adjust("alice", 0.5).await.unwrap().reputation_score, 5.5);
        assert_eq!(ledger.adjust("alice", -1.5).await.unwrap().reputation_score, 4.0);
        assert_eq!(ledger.get_reputation("alice").await.unwrap().reputation_score, 4.0);
    }

    #[tokio::test]
    async fn test_adjust_stays_in_bounds() {
        let ledger = ReputationLedger::default();

        for delta in [-10.0, -1e9, 3.0, 1e9, f64::INFINITY, f64::NEG_INFINITY, f64::NAN, 0.25] {
            let score = ledger.adjust("bob", delta).await.unwrap().reputation_score;
            assert!((0.0..=10.0).contains(&score), "score {score} after delta {delta}");
        }
    }

    #[tokio::test]
    async fn test_penalty_floors_at_zero() {
        let ledger = ReputationLedger::default();
        let reputation = ledger.adjust("employer", -10.0).await.unwrap();
        assert_eq!(reputation.reputation_score, 0.0);
    }

    #[tokio::test]
    async fn test_increment_trades_leaves_score() {
        let ledger = ReputationLedger::default();
        ledger.increment_trades("worker").await.unwrap();
        let reputation = ledger.increment_trades("worker").await.unwrap();

        assert_eq!(reputation.trades_completed, 2);
        assert_eq!(reputation.reputation_score, 5.0);
    }
}
