//! Key Issuance Service - one-time, time-bounded unlock keys (MZKeys)
//!
//! Keys are 256 random bits, hex-encoded behind an `mzkey_` prefix. A key
//! is single-use only in combination with the task's `funds_claimed` flag,
//! which the lifecycle manager checks before releasing a vault.

use crate::{EscrowResult, error::EscrowError, models::Task};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

pub const MZKEY_PREFIX: &str = "mzkey_";

/// Upper bound on `key_ttl_hours` (30 days)
pub const MAX_KEY_TTL_HOURS: i64 = 720;

/// Configuration for key issuance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyIssuanceConfig {
    /// Lifetime of an unlock key in hours
    pub key_ttl_hours: i64,
}

impl Default for KeyIssuanceConfig {
    fn default() -> Self {
        Self { key_ttl_hours: 24 }
    }
}

impl KeyIssuanceConfig {
    /// Key lifetime, rejecting values outside `1..=MAX_KEY_TTL_HOURS`
    pub fn ttl(&self) -> EscrowResult<Duration> {
        if !(1..=MAX_KEY_TTL_HOURS).contains(&self.key_ttl_hours) {
            return Err(EscrowError::config(format!(
                "keys.key_ttl_hours must be between 1 and {}, got {}",
                MAX_KEY_TTL_HOURS, self.key_ttl_hours
            )));
        }

        Duration::try_hours(self.key_ttl_hours)
            .ok_or_else(|| EscrowError::config("keys.key_ttl_hours is out of range"))
    }
}

/// A freshly minted unlock key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MzKey {
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

/// Mints and checks unlock keys
pub struct KeyIssuer {
    ttl: Duration,
}

impl KeyIssuer {
    pub fn new(config: KeyIssuanceConfig) -> EscrowResult<Self> {
        Ok(Self { ttl: config.ttl()? })
    }

    /// Mint a key expiring `key_ttl_hours` from now
    pub fn generate_mzkey(&self) -> EscrowResult<MzKey> {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);

        let expires_at = Utc::now()
            .checked_add_signed(self.ttl)
            .ok_or_else(|| EscrowError::internal("Unlock key expiry overflows the clock"))?;

        Ok(MzKey {
            key: format!("{}{}", MZKEY_PREFIX, hex::encode(bytes)),
            expires_at,
        })
    }

    /// Check `supplied` against the key stored on `task`
    pub fn validate(&self, task: &Task, supplied: &str) -> EscrowResult<()> {
        self.validate_at(task, supplied, Utc::now())
    }

    /// Same as [`KeyIssuer::validate`] with an explicit clock reading
    pub fn validate_at(
        &self,
        task: &Task,
        supplied: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        let issued = task.mzkey.as_deref().ok_or(EscrowError::InvalidKey)?;

        if !keys_match(issued, supplied) {
            return Err(EscrowError::InvalidKey);
        }

        match task.mzkey_expires {
            Some(expires) if now <= expires => Ok(()),
            _ => Err(EscrowError::ExpiredKey),
        }
    }
}

impl Default for KeyIssuer {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(24),
        }
    }
}

// Constant time over the bytes; only the length can short-circuit
fn keys_match(issued: &str, supplied: &str) -> bool {
    issued.len() == supplied.len() && bool::from(issued.as_bytes().ct_eq(supplied.as_bytes()))
}
