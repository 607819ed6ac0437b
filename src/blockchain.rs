//! Blocks, the append-only chain store and the UTXO ledger projection.

pub mod core;
pub use core::*;
