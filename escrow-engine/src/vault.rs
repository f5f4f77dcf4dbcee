//! Vault Manager - seals seed phrases and guards the vault lock state
//!
//! A seed phrase is sealed in three nested layers, each bound to one token:
//! the worker-facing pera secret key, the task id, and the deployment master
//! key. Every layer is AES-256-GCM under a SHA-256 key derived from its token
//! and is base64-encoded before the next layer wraps it. Opening peels the
//! layers in reverse; a wrong token at any layer fails authentication.

use crate::{
    EscrowResult,
    error::EscrowError,
    models::{Vault, VaultStatus},
};
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

const NONCE_LEN: usize = 12;

/// Configuration for the vault manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Deployment-wide secret bound into the outermost layer
    pub master_key: String,
}

#[derive(Debug, Clone, Copy)]
enum Layer {
    PeraKey,
    TaskId,
    MasterKey,
}

impl Layer {
    fn label(self) -> &'static [u8] {
        match self {
            Self::PeraKey => b"tipvault/vault/layer1",
            Self::TaskId => b"tipvault/vault/layer2",
            Self::MasterKey => b"tipvault/vault/layer3",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::PeraKey => "pera key layer",
            Self::TaskId => "task layer",
            Self::MasterKey => "master layer",
        }
    }
}

/// Seals and opens vault blobs
pub struct VaultManager {
    master_key: String,
}

impl VaultManager {
    /// Create a new vault manager
    pub fn new(config: VaultConfig) -> EscrowResult<Self> {
        if config.master_key.trim().is_empty() {
            return Err(EscrowError::config("Vault master key must be set"));
        }

        Ok(Self {
            master_key: config.master_key,
        })
    }

    /// Seal `seed` for the given pera key and task
    pub fn encode(&self, seed: &str, pera_secret_key: &str, task_id: Uuid) -> EscrowResult<String> {
        let task_token = task_id.to_string();

        let layer1 = seal(Layer::PeraKey, pera_secret_key, seed.as_bytes())?;
        let layer2 = seal(Layer::TaskId, &task_token, layer1.as_bytes())?;
        let layer3 = seal(Layer::MasterKey, &self.master_key, layer2.as_bytes())?;

        debug!("Sealed vault blob for task {}", task_id);
        Ok(layer3)
    }

    /// Open a blob produced by [`VaultManager::encode`]
    pub fn decode(&self, blob: &str, pera_secret_key: &str, task_id: Uuid) -> EscrowResult<String> {
        let task_token = task_id.to_string();

        let layer2 = open(Layer::MasterKey, &self.master_key, blob)?;
        let layer1 = open(Layer::TaskId, &task_token, &utf8(Layer::TaskId, layer2)?)?;
        let seed = open(Layer::PeraKey, pera_secret_key, &utf8(Layer::PeraKey, layer1)?)?;

        utf8(Layer::PeraKey, seed)
    }

    /// Build a locked vault around a freshly sealed seed phrase
    pub fn lock(&self, task_id: Uuid, seed: &str, pera_secret_key: &str) -> EscrowResult<Vault> {
        let encrypted_seed_phrase = self.encode(seed, pera_secret_key, task_id)?;

        Ok(Vault {
            id: Uuid::new_v4(),
            task_id,
            encrypted_seed_phrase,
            pera_secret_key: pera_secret_key.to_string(),
            status: VaultStatus::Locked,
            claimed_by: None,
            unlock_timestamp: None,
        })
    }
}

impl Vault {
    /// locked -> unlocked
    pub fn unlock(&mut self) -> EscrowResult<()> {
        if self.status != VaultStatus::Locked {
            return Err(EscrowError::invalid_state(
                self.status.as_str(),
                VaultStatus::Unlocked.as_str(),
                "Only a locked vault can be unlocked",
            ));
        }

        self.status = VaultStatus::Unlocked;
        info!("Unlocked vault {} for task {}", self.id, self.task_id);
        Ok(())
    }

    /// unlocked -> claimed
    pub fn mark_claimed(&mut self, claimed_by: &str, at: DateTime<Utc>) -> EscrowResult<()> {
        if self.status != VaultStatus::Unlocked {
            return Err(EscrowError::invalid_state(
                self.status.as_str(),
                VaultStatus::Claimed.as_str(),
                "Only an unlocked vault can be claimed",
            ));
        }

        self.status = VaultStatus::Claimed;
        self.claimed_by = Some(claimed_by.to_string());
        self.unlock_timestamp = Some(at);
        info!("Vault {} claimed by {}", self.id, claimed_by);
        Ok(())
    }
}

fn layer_cipher(layer: Layer, token: &str) -> Aes256Gcm {
    let digest = Sha256::new()
        .chain_update(layer.label())
        .chain_update(token.as_bytes())
        .finalize();
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&digest))
}

fn seal(layer: Layer, token: &str, plaintext: &[u8]) -> EscrowResult<String> {
    let cipher = layer_cipher(layer, token);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: layer.label(),
            },
        )
        .map_err(|e| EscrowError::internal(format!("Failed to seal {}: {}", layer.name(), e)))?;

    // Nonce travels in front of the ciphertext
    let mut sealed = nonce.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok(general_purpose::STANDARD.encode(sealed))
}

fn open(layer: Layer, token: &str, encoded: &str) -> EscrowResult<Vec<u8>> {
    let sealed = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| {
            EscrowError::decoding(format!("{} is not valid base64: {}", layer.name(), e))
        })?;

    if sealed.len() <= NONCE_LEN {
        return Err(EscrowError::decoding(format!("{} is truncated", layer.name())));
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    layer_cipher(layer, token)
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: layer.label(),
            },
        )
        .map_err(|_| EscrowError::decoding(format!("{} failed authentication", layer.name())))
}

fn utf8(layer: Layer, bytes: Vec<u8>) -> EscrowResult<String> {
    String::from_utf8(bytes)
        .map_err(|_| EscrowError::decoding(format!("{} did not yield UTF-8", layer.name())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "abandon ability able about above absent absorb abstract absurd abuse access accident";

    fn manager() -> VaultManager {
        VaultManager::new(VaultConfig {
            master_key: "test-master-key".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let manager = manager();
        let task_id = Uuid::new_v4();

        let blob = manager.encode(SEED, "pera_secret", task_id).unwrap();
        assert!(!blob.contains("abandon"));
        assert_eq!(manager.decode(&blob, "pera_secret", task_id).unwrap(), SEED);
    }

    #[test]
    fn test_round_trip_unicode_and_empty() {
        let manager = manager();
        let task_id = Uuid::new_v4();

        for seed in ["", "żółw 🐢 seed"] {
            let blob = manager.encode(seed, "k", task_id).unwrap();
            assert_eq!(manager.decode(&blob, "k", task_id).unwrap(), seed);
        }
    }

    #[test]
    fn test_wrong_pera_key_fails() {
        let manager = manager();
        let task_id = Uuid::new_v4();
        let blob = manager.encode(SEED, "pera_secret", task_id).unwrap();

        let err = manager.decode(&blob, "other", task_id).unwrap_err();
        assert!(matches!(err, EscrowError::Decoding(_)));
    }

    #[test]
    fn test_wrong_task_fails() {
        let manager = manager();
        let blob = manager.encode(SEED, "pera_secret", Uuid::new_v4()).unwrap();

        let err = manager.decode(&blob, "pera_secret", Uuid::new_v4()).unwrap_err();
        assert_eq!(err.code(), "decoding_error");
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let task_id = Uuid::new_v4();
        let blob = manager().encode(SEED, "pera_secret", task_id).unwrap();

        let other = VaultManager::new(VaultConfig {
            master_key: "another-master".to_string(),
        })
        .unwrap();
        assert!(other.decode(&blob, "pera_secret", task_id).is_err());
    }

    #[test]
    fn test_garbage_blob_fails() {
        let manager = manager();
        let task_id = Uuid::new_v4();

        assert!(manager.decode("not base64 at all!", "k", task_id).is_err());
        assert!(manager.decode("AAAA", "k", task_id).is_err());
    }

    #[test]
    fn test_empty_master_key_rejected() {
        assert!(VaultManager::new(VaultConfig::default()).is_err());
    }

    #[test]
    fn test_vault_state_machine() {
        let manager = manager();
        let mut vault = manager.lock(Uuid::new_v4(), SEED, "pera_secret").unwrap();
        assert_eq!(vault.status, VaultStatus::Locked);

        assert!(vault.mark_claimed("worker", Utc::now()).is_err());
        vault.unlock().unwrap();
        assert!(vault.unlock().is_err());

        vault.mark_claimed("worker", Utc::now()).unwrap();
        assert_eq!(vault.status, VaultStatus::Claimed);
        assert_eq!(vault.claimed_by.as_deref(), Some("worker"));

        // claimed -> unlocked always fails
        assert!(vault.unlock().is_err());
        assert!(vault.mark_claimed("worker", Utc::now()).is_err());
    }
}
