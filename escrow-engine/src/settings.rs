//! Layered engine settings
//!
//! Defaults come from each service's `*Config`, then an optional TOML file,
//! then `TIPVAULT__*` environment variables (`TIPVAULT__VAULT__MASTER_KEY`,
//! `TIPVAULT__MONITOR__INTERVAL_SECS`, ...).

use crate::{
    EscrowResult, error::EscrowError, fraud_monitor::FraudMonitorConfig,
    gateway::GatewayConfig, key_issuance::KeyIssuanceConfig,
    reputation_ledger::ReputationLedgerConfig, task_manager::TaskManagerConfig,
    vault::VaultConfig,
};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_PREFIX: &str = "TIPVAULT";

const BALANCE_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 5..=10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub task: TaskManagerConfig,
    pub keys: KeyIssuanceConfig,
    pub reputation: ReputationLedgerConfig,
    pub monitor: FraudMonitorConfig,
    pub vault: VaultConfig,
    pub gateway: GatewayConfig,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            task: TaskManagerConfig::default(),
            keys: KeyIssuanceConfig::default(),
            reputation: ReputationLedgerConfig::default(),
            monitor: FraudMonitorConfig::default(),
            vault: VaultConfig::default(),
            gateway: GatewayConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl EngineSettings {
    /// Load settings from `path` (if given) and the environment
    pub fn load(path: Option<&Path>) -> EscrowResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| EscrowError::config(format!("Failed to load settings: {}", e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Range checks. The vault master key is checked when the vault is built.
    pub fn validate(&self) -> EscrowResult<()> {
        for (name, secs) in [
            ("task.balance_timeout_secs", self.task.balance_timeout_secs),
            ("monitor.balance_timeout_secs", self.monitor.balance_timeout_secs),
        ] {
            if !BALANCE_TIMEOUT_RANGE.contains(&secs) {
                return Err(EscrowError::config(format!(
                    "{} must be between {} and {} seconds, got {}",
                    name,
                    BALANCE_TIMEOUT_RANGE.start(),
                    BALANCE_TIMEOUT_RANGE.end(),
                    secs
                )));
            }
        }

        if self.monitor.interval_secs == 0 {
            return Err(EscrowError::config("monitor.interval_secs must be positive"));
        }

        self.keys.ttl()?;

        let rep = &self.reputation;
        if !(rep.min_score <= rep.initial_score && rep.initial_score <= rep.max_score) {
            return Err(EscrowError::config(
                "reputation.initial_score must lie within [min_score, max_score]",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_issuance::MAX_KEY_TTL_HOURS;
    use std::fs;
    use uuid::Uuid;

    fn write_toml(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("tipvault-{}.toml", Uuid::new_v4()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.task.balance_timeout_secs, 8);
        assert_eq!(settings.monitor.interval_secs, 30);
        assert_eq!(settings.keys.key_ttl_hours, 24);
        assert_eq!(settings.reputation.initial_score, 5.0);
        assert_eq!(settings.log_filter, "info");
    }

    #[test]
    fn test_defaults_validate() {
        assert!(EngineSettings::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_score_bounds() {
        let mut settings = EngineSettings::default();
        settings.reputation.initial_score = 11.0;
        assert_eq!(settings.validate().unwrap_err().code(), "config_error");
    }

    #[test]
    fn test_validate_key_ttl_bounds() {
        let mut settings = EngineSettings::default();
        for hours in [0, MAX_KEY_TTL_HOURS + 1, i64::MAX] {
            settings.keys.key_ttl_hours = hours;
            let err = settings.validate().unwrap_err();
            assert!(err.to_string().contains("keys.key_ttl_hours"));
        }

        settings.keys.key_ttl_hours = MAX_KEY_TTL_HOURS;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let path = write_toml(
            r#"
            [vault]
            master_key = "from-file"

            [monitor]
            interval_secs = 5
            "#,
        );

        let settings = EngineSettings::load(Some(path.as_path())).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(settings.vault.master_key, "from-file");
        assert_eq!(settings.monitor.interval_secs, 5);
        assert_eq!(settings.monitor.balance_timeout_secs, 8);
        assert_eq!(settings.gateway.base_url, "https://api.kaspa.org");
    }

    #[test]
    fn test_load_rejects_out_of_range_timeout() {
        let path = write_toml(
            r#"
            [vault]
            master_key = "k"

            [task]
            balance_timeout_secs = 30
            "#,
        );

        let err = EngineSettings::load(Some(path.as_path())).unwrap_err();
        fs::remove_file(&path).unwrap();
        assert!(err.to_string().contains("task.balance_timeout_secs"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("tipvault-does-not-exist.toml");
        assert!(EngineSettings::load(Some(path.as_path())).is_err());
    }
}
