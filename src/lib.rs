//! ZakatChain - a UTXO ledger with proof-of-work blocks and a monthly zakat levy
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Blocks, the chain store and the UTXO ledger
//! - [`transaction`] - Transaction types and validation
//! - [`mempool`] - Pending transaction pool
//! - [`engine`] - Single writer tying chain, ledger and mempool together
//!
//! ## Consensus
//! - [`miner`] - Proof-of-work search
//!
//! ## Cryptography
//! - [`crypto`] - Wallet ids and signatures (secp256k1)
//!
//! ## Zakat & Accounts
//! - [`zakat`] - Monthly levy scheduler and records
//! - [`accounts`] - Users, one-time passcodes and session tokens
//! - [`audit`] - System and transaction audit trail
//!
//! ## State Management
//! - [`persistence`] - Database layer (SQLite)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//! - [`amount`] - Fixed-point amounts

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod engine;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod miner;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Zakat & Accounts
// ============================================================================
pub mod accounts;
pub mod audit;
pub mod zakat;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;
pub mod node;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod amount;
pub mod config;
pub mod error;
