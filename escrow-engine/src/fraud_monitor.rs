//! Fraud Detection Monitor - reconciles burner wallets against the ledger
//!
//! Each watched task owns one timer. The timer ticks on a fixed interval,
//! runs [`FraudMonitor::check`], and stops itself once the task is terminal.
//! The node also cancels it explicitly after approval or void. Stopping only
//! interrupts the wait between ticks, never a check in flight, so a void and
//! its penalty are never split. A task's slot is dropped from the timer map
//! as soon as its timer loop exits.

use crate::{
    EscrowResult,
    error::EscrowError,
    gateway::{BlockchainGateway, balance_within},
    task_manager::{BalanceCheck, MONITOR_VOID_REASON, TaskLifecycleManager},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{RwLock, oneshot},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for the fraud monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudMonitorConfig {
    /// Seconds between balance checks for one task
    pub interval_secs: u64,
    /// Deadline for a single balance query in seconds
    pub balance_timeout_secs: u64,
}

impl Default for FraudMonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            balance_timeout_secs: 8,
        }
    }
}

/// Handle to a running per-task timer
#[derive(Debug)]
pub struct TimerHandle {
    generation: u64,
    stop: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Timer slot for one task. A `Cancelled` slot lasts only until the loop of
/// that generation exits.
#[derive(Debug)]
pub enum TaskTimer {
    Active(TimerHandle),
    Cancelled(u64),
}

impl TaskTimer {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    fn generation(&self) -> u64 {
        match self {
            Self::Active(handle) => handle.generation,
            Self::Cancelled(generation) => *generation,
        }
    }
}

/// Result of one monitor pass over a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorOutcome {
    pub task_id: Uuid,
    pub check: BalanceCheck,
    /// `None` when the task was terminal and the gateway was not asked
    pub current_balance: Option<Decimal>,
}

impl MonitorOutcome {
    pub fn fraud_detected(&self) -> bool {
        self.check == BalanceCheck::FraudDetected
    }

    /// Task can no longer change, so its timer has nothing left to do
    pub fn is_final(&self) -> bool {
        matches!(self.check, BalanceCheck::FraudDetected | BalanceCheck::Skipped(_))
    }

    /// The fraud finding as a structured error, if there was one
    pub fn as_error(&self) -> Option<EscrowError> {
        self.fraud_detected().then(|| {
            EscrowError::fraud_detected(format!(
                "Task {}: {}",
                self.task_id, MONITOR_VOID_REASON
            ))
        })
    }
}

/// Per-task burner wallet reconciliation
pub struct FraudMonitor {
    config: FraudMonitorConfig,
    manager: Arc<TaskLifecycleManager>,
    gateway: Arc<dyn BlockchainGateway>,
    timers: Arc<RwLock<HashMap<Uuid, TaskTimer>>>,
    generations: AtomicU64,
}

impl FraudMonitor {
    /// Create a new fraud monitor
    pub fn new(
        config: FraudMonitorConfig,
        manager: Arc<TaskLifecycleManager>,
        gateway: Arc<dyn BlockchainGateway>,
    ) -> Self {
        Self {
            config,
            manager,
            gateway,
            timers: Arc::new(RwLock::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    /// One reconciliation pass. Safe to run repeatedly and concurrently.
    pub async fn check(&self, task_id: Uuid) -> EscrowResult<MonitorOutcome> {
        let task = self.manager.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(MonitorOutcome {
                task_id,
                check: BalanceCheck::Skipped(task.status),
                current_balance: None,
            });
        }

        let balance = balance_within(
            self.gateway.as_ref(),
            &task.burner_wallet_address,
            Duration::from_secs(self.config.balance_timeout_secs),
        )
        .await?;

        let check = self.manager.record_balance_check(task_id, balance).await?;
        debug!("Monitor pass on task {}: {:?}", task_id, check);

        Ok(MonitorOutcome {
            task_id,
            check,
            current_balance: Some(balance.to_kas()),
        })
    }

    /// Start the timer for `task_id` unless one is already running
    pub async fn watch(self: &Arc<Self>, task_id: Uuid) {
        // Held across the spawn so the timer cannot finish before its
        // handle is registered
        let mut timers = self.timers.write().await;
        if timers.get(&task_id).is_some_and(TaskTimer::is_active) {
            debug!("Task {} already watched", task_id);
            return;
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (stop, stop_rx) = oneshot::channel();
        let monitor = Arc::clone(self);
        let join =
            tokio::spawn(async move { monitor.run_timer(task_id, generation, stop_rx).await });

        timers.insert(
            task_id,
            TaskTimer::Active(TimerHandle {
                generation,
                stop,
                join,
            }),
        );
        info!(
            "Watching task {} every {}s",
            task_id, self.config.interval_secs
        );
    }

    /// Stop the timer for `task_id`. Returns whether one was running.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let mut timers = self.timers.write().await;
        let Some(slot) = timers.get_mut(&task_id) else {
            return false;
        };

        let generation = slot.generation();
        match std::mem::replace(slot, TaskTimer::Cancelled(generation)) {
            TaskTimer::Active(handle) => {
                // Receiver is gone if the timer already returned
                let _ = handle.stop.send(());
                info!("Stopped watching task {}", task_id);
                true
            }
            TaskTimer::Cancelled(_) => false,
        }
    }

    /// Whether a timer is currently registered as active for `task_id`
    pub async fn is_watching(&self, task_id: Uuid) -> bool {
        self.timers
            .read()
            .await
            .get(&task_id)
            .is_some_and(TaskTimer::is_active)
    }

    pub async fn active_timers(&self) -> usize {
        self.timers
            .read()
            .await
            .values()
            .filter(|timer| timer.is_active())
            .count()
    }

    /// Stop every timer and wait for them to wind down
    pub async fn shutdown(&self) {
        let handles: Vec<TimerHandle> = {
            let mut timers = self.timers.write().await;
            timers
                .drain()
                .filter_map(|(_, timer)| match timer {
                    TaskTimer::Active(handle) => Some(handle),
                    TaskTimer::Cancelled(_) => None,
                })
                .collect()
        };

        info!("Stopping {} task timers", handles.len());
        for handle in handles {
            let _ = handle.stop.send(());
            if let Err(e) = handle.join.await {
                warn!("Task timer ended abnormally: {}", e);
            }
        }
    }

    async fn run_timer(&self, task_id: Uuid, generation: u64, mut stop: oneshot::Receiver<()>) {
        // First pass one period after posting
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    debug!("Timer for task {} stopped", task_id);
                    self.finish(task_id, generation).await;
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.check(task_id).await {
                Ok(outcome) if outcome.is_final() => {
                    if let Some(err) = outcome.as_error() {
                        error!(code = err.code(), "{}", err);
                    }
                    self.finish(task_id, generation).await;
                    return;
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(
                        code = e.code(),
                        "Monitor pass on task {} failed, will retry: {}", task_id, e
                    );
                }
                Err(e) => {
                    error!(code = e.code(), "Monitor for task {} giving up: {}", task_id, e);
                    self.finish(task_id, generation).await;
                    return;
                }
            }
        }
    }

    /// Drop the slot for `task_id` unless a newer timer already owns it
    async fn finish(&self, task_id: Uuid, generation: u64) {
        let mut timers = self.timers.write().await;
        if timers
            .get(&task_id)
            .is_some_and(|timer| timer.generation() == generation)
        {
            timers.remove(&task_id);
            info!("Timer for task {} finished", task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gateway::{InMemoryBlockchainGateway, LoggingNotifier},
        key_issuance::KeyIssuer,
        models::{Balance, TaskStatus},
        reputation_ledger::ReputationLedger,
        store::{EscrowStore, InMemoryEscrowStore},
        task_manager::{PostTaskRequest, TaskManagerConfig},
        vault::{VaultConfig, VaultManager},
    };
    use async_trait::async_trait;

    const BURNER: &str = "kaspa:qmonitored";

    struct StalledGateway;

    #[async_trait]
    impl BlockchainGateway for StalledGateway {
        async fn get_balance(&self, _address: &str) -> EscrowResult<Balance> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Balance::from_sompi(0))
        }
    }

    struct Harness {
        monitor: Arc<FraudMonitor>,
        manager: Arc<TaskLifecycleManager>,
        store: InMemoryEscrowStore,
        gateway: InMemoryBlockchainGateway,
        ledger: Arc<ReputationLedger>,
    }

    fn harness(interval_secs: u64) -> Harness {
        let gateway = InMemoryBlockchainGateway::new();
        harness_with(interval_secs, gateway.clone(), Arc::new(gateway))
    }

    /// `monitor_gateway` answers the monitor's queries only
    fn harness_with(
        interval_secs: u64,
        gateway: InMemoryBlockchainGateway,
        monitor_gateway: Arc<dyn BlockchainGateway>,
    ) -> Harness {
        let store = InMemoryEscrowStore::new();
        let ledger = Arc::new(ReputationLedger::default());
        let vault_config = VaultConfig {
            master_key: "m".to_string(),
        };
        let manager = Arc::new(TaskLifecycleManager::new(
            TaskManagerConfig::default(),
            Arc::new(store.clone()),
            Arc::new(VaultManager::new(vault_config).unwrap()),
            Arc::new(KeyIssuer::default()),
            ledger.clone(),
            Arc::new(gateway.clone()),
            Arc::new(LoggingNotifier),
        ));
        let monitor = Arc::new(FraudMonitor::new(
            FraudMonitorConfig {
                interval_secs,
                balance_timeout_secs: 8,
            },
            manager.clone(),
            monitor_gateway,
        ));

        Harness {
            monitor,
            manager,
            store,
            gateway,
            ledger,
        }
    }

    async fn post(h: &Harness, tip: i64) -> Uuid {
        let task = h
            .manager
            .post_task(PostTaskRequest {
                employer_id: "employer".to_string(),
                worker_id: "worker".to_string(),
                tip_amount: Decimal::from(tip),
                burner_wallet_address: BURNER.to_string(),
                seed_phrase: "seed words".to_string(),
                pera_secret_key: "pera".to_string(),
            })
            .await
            .unwrap();
        h.manager.submit_for_approval(task.id, "worker").await.unwrap();
        task.id
    }

    async fn employer_score(h: &Harness) -> f64 {
        h.ledger
            .get_reputation("employer")
            .await
            .unwrap()
            .reputation_score
    }

    async fn status(h: &Harness, task_id: Uuid) -> TaskStatus {
        h.manager.get_task(task_id).await.unwrap().status
    }

    /// Let spawned timer loops run to their next await point
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn slots(h: &Harness) -> usize {
        h.monitor.timers.read().await.len()
    }

    #[tokio::test]
    async fn test_check_funded_then_drained() {
        let h = harness(30);
        let task_id = post(&h, 30).await;
        h.gateway.set_balance(BURNER, Balance::from_kas(Decimal::from(30))).await;

        let outcome = h.monitor.check(task_id).await.unwrap();
        assert_eq!(outcome.check, BalanceCheck::Verified);
        assert_eq!(outcome.current_balance, Some(Decimal::from(30)));
        assert!(outcome.as_error().is_none());

        h.gateway.set_balance(BURNER, Balance::from_sompi(0)).await;
        let outcome = h.monitor.check(task_id).await.unwrap();
        assert!(outcome.fraud_detected());
        assert_eq!(outcome.as_error().unwrap().code(), "fraud_detected");
        assert_eq!(employer_score(&h).await, 0.0);

        let outcome = h.monitor.check(task_id).await.unwrap();
        assert_eq!(outcome.check, BalanceCheck::Skipped(TaskStatus::Voided));
        assert_eq!(outcome.current_balance, None);
    }

    #[tokio::test]
    async fn test_concurrent_checks_penalize_once() {
        let h = harness(30);
        let task_id = post(&h, 30).await;
        h.ledger.adjust("employer", 5.0).await.unwrap();

        let checks = (0..8).map(|_| {
            let monitor = h.monitor.clone();
            tokio::spawn(async move { monitor.check(task_id).await })
        });
        let mut detections = 0;
        for check in checks {
            if check.await.unwrap().unwrap().fraud_detected() {
                detections += 1;
            }
        }

        assert_eq!(detections, 1);
        // 5.0 + 5.0 - 10.0, penalty applied exactly once
        assert_eq!(employer_score(&h).await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stops_itself_on_fraud() {
        let h = harness(30);
        let task_id = post(&h, 30).await;
        h.gateway.set_balance(BURNER, Balance::from_kas(Decimal::from(30))).await;

        h.monitor.watch(task_id).await;
        h.monitor.watch(task_id).await;
        assert_eq!(h.monitor.active_timers().await, 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.monitor.is_watching(task_id).await);
        assert!(h.manager.get_task(task_id).await.unwrap().balance_verified);

        h.gateway.set_balance(BURNER, Balance::from_sompi(0)).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(status(&h, task_id).await, TaskStatus::Voided);
        assert!(!h.monitor.is_watching(task_id).await);
        assert_eq!(slots(&h).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_timer() {
        let h = harness(30);
        let task_id = post(&h, 30).await;

        h.monitor.watch(task_id).await;
        assert!(h.monitor.cancel(task_id).await);
        assert!(!h.monitor.cancel(task_id).await);
        assert!(!h.monitor.is_watching(task_id).await);

        settle().await;
        assert_eq!(slots(&h).await, 0);
        assert!(!h.monitor.cancel(task_id).await);

        // Unknown ids leave no trace
        assert!(!h.monitor.cancel(Uuid::new_v4()).await);
        assert_eq!(slots(&h).await, 0);

        h.monitor.watch(task_id).await;
        assert!(h.monitor.is_watching(task_id).await);
        h.monitor.shutdown().await;
        assert_eq!(h.monitor.active_timers().await, 0);
        assert_eq!(slots(&h).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewatch_survives_old_timer_exit() {
        let h = harness(30);
        let task_id = post(&h, 30).await;

        h.monitor.watch(task_id).await;
        assert!(h.monitor.cancel(task_id).await);
        // Replaces the cancelled slot before the old loop has exited
        h.monitor.watch(task_id).await;

        settle().await;
        assert!(h.monitor.is_watching(task_id).await);
        assert_eq!(slots(&h).await, 1);

        h.monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_timeout_keeps_task_and_timer() {
        let gateway = InMemoryBlockchainGateway::new();
        let h = harness_with(30, gateway, Arc::new(StalledGateway));
        let task_id = post(&h, 30).await;
        let before = h.store.load(task_id).await.unwrap().unwrap();

        let err = h.monitor.check(task_id).await.unwrap_err();
        assert_eq!(err.code(), "gateway_timeout");
        assert!(err.is_transient());

        let after = h.store.load(task_id).await.unwrap().unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.task.status, TaskStatus::AwaitingApproval);
        assert_eq!(after.task.last_balance_check, before.task.last_balance_check);

        // Ticks at 30s and 60s, each query abandoned 8s later
        h.monitor.watch(task_id).await;
        tokio::time::sleep(Duration::from_secs(70)).await;

        assert!(h.monitor.is_watching(task_id).await);
        let after = h.store.load(task_id).await.unwrap().unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(status(&h, task_id).await, TaskStatus::AwaitingApproval);
        assert_eq!(employer_score(&h).await, 5.0);

        assert!(h.monitor.cancel(task_id).await);
        settle().await;
        assert_eq!(slots(&h).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let h = harness(30);
        let err = h.monitor.check(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
