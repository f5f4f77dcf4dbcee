//! Application-level escrow for crypto-funded gig tasks
//!
//! An employer funds a single-use burner wallet and hands its seed phrase to
//! the engine, which seals it in a vault. On approval the worker receives a
//! one-time unlock key (MZKey) and trades it for the seed phrase exactly once.
//! A per-task monitor voids the escrow if the employer drains the wallet
//! first.
//!
//! - [`task_manager`] drives the task state machine with optimistic writes
//! - [`vault`] seals seed phrases under three AES-256-GCM layers
//! - [`fraud_monitor`] reconciles burner-wallet balances on a timer
//! - [`node`] wires everything together behind a small request surface

pub mod api;
pub mod error;
pub mod fraud_monitor;
pub mod gateway;
pub mod key_issuance;
pub mod models;
pub mod node;
pub mod reputation_ledger;
pub mod settings;
pub mod store;
pub mod task_manager;
pub mod telemetry;
pub mod vault;

use error::EscrowError;

pub use node::EscrowNode;
pub use settings::EngineSettings;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
