//! peerchain - a small replicated ledger node
//!
//! # Architecture
//!
//! ## Ledger
//! - [`blockchain`] - Blocks, validation and the local ledger
//! - [`transaction`] - Transaction types and per-transaction checks
//! - [`miner`] - Candidate block assembly
//!
//! ## Replication
//! - [`events`] - In-process event bus
//! - [`peers`] - Peer registry, handshakes and fan-out
//! - [`consensus`] - Longest-valid-chain reconciliation
//! - [`network`] - Peer transports (HTTP and in-process)
//!
//! ## Node
//! - [`node`] - The façade tying the pieces together
//! - [`api`] - REST surface (feature `api`)
//!
//! ## Configuration & Utilities
//! - [`config`], [`logging`], [`persistence`], [`crypto`], [`error`]

#![forbid(unsafe_code)]

// ============================================================================
// Ledger
// ============================================================================
pub mod blockchain;
pub mod miner;
pub mod transaction;

// ============================================================================
// Replication
// ============================================================================
pub mod consensus;
pub mod events;
pub mod network;
pub mod peers;

// ============================================================================
// Node & Integration
// ============================================================================
pub mod node;

#[cfg(feature = "api")]
pub mod api;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod persistence;

pub use blockchain::{Block, Blockchain, Validator};
pub use config::Config;
pub use error::{ChainError, Result};
pub use node::{Node, NodeState};
pub use peers::Peer;
pub use transaction::Transaction;
