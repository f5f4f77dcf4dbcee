//! External collaborators: blockchain balance lookups and worker notifications
//!
//! The engine never broadcasts transactions. All it needs from the chain is
//! the current balance of a burner wallet.

use crate::{EscrowResult, error::EscrowError, models::Balance};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Read-only view of the ledger
#[async_trait]
pub trait BlockchainGateway: Send + Sync {
    /// Current balance of `address` in sompi
    async fn get_balance(&self, address: &str) -> EscrowResult<Balance>;
}

/// Delivery of void notices to workers
#[async_trait]
pub trait WorkerNotifier: Send + Sync {
    async fn notify_worker(&self, task_id: Uuid, reason: &str) -> EscrowResult<()>;
}

/// Configuration for the HTTP gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of a Kaspa REST API
    pub base_url: String,
    /// Hard ceiling on a single HTTP request in seconds
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.kaspa.org".to_string(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: u64,
}

/// Balance lookups over a Kaspa REST API
pub struct HttpBlockchainGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBlockchainGateway {
    pub fn new(config: GatewayConfig) -> EscrowResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EscrowError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn balance_url(&self, address: &str) -> String {
        format!("{}/addresses/{}/balance", self.base_url, address)
    }
}

#[async_trait]
impl BlockchainGateway for HttpBlockchainGateway {
    async fn get_balance(&self, address: &str) -> EscrowResult<Balance> {
        let url = self.balance_url(address);
        debug!("Querying balance: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| {
                if e.is_timeout() {
                    EscrowError::gateway_timeout(format!("Balance query for {} timed out", address))
                } else {
                    EscrowError::gateway(format!("Balance query for {} failed: {}", address, e))
                }
            })?;

        let body: BalanceResponse = response.json().await.map_err(|e| {
            EscrowError::gateway(format!("Malformed balance response for {}: {}", address, e))
        })?;

        Ok(Balance::from_sompi(body.balance))
    }
}

/// Gateway backed by a local map, for development runs and tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryBlockchainGateway {
    balances: Arc<RwLock<HashMap<String, Balance>>>,
}

impl InMemoryBlockchainGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_balance(&self, address: &str, balance: Balance) {
        self.balances
            .write()
            .await
            .insert(address.to_string(), balance);
    }
}

#[async_trait]
impl BlockchainGateway for InMemoryBlockchainGateway {
    async fn get_balance(&self, address: &str) -> EscrowResult<Balance> {
        Ok(self
            .balances
            .read()
            .await
            .get(address)
            .copied()
            .unwrap_or(Balance::from_sompi(0)))
    }
}

/// Notifier that only logs; delivery is handled outside this crate
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl WorkerNotifier for LoggingNotifier {
    async fn notify_worker(&self, task_id: Uuid, reason: &str) -> EscrowResult<()> {
        warn!("Worker notification for task {}: {}", task_id, reason);
        Ok(())
    }
}

/// Query `gateway`, turning an overrun of `limit` into a gateway timeout
pub async fn balance_within(
    gateway: &dyn BlockchainGateway,
    address: &str,
    limit: Duration,
) -> EscrowResult<Balance> {
    match tokio::time::timeout(limit, gateway.get_balance(address)).await {
        Ok(result) => result,
        Err(_) => {
            info!("Balance query for {} exceeded {:?}", address, limit);
            Err(EscrowError::gateway_timeout(format!(
                "No balance for {} within {:?}",
                address, limit
            )))
        }
    }
}
