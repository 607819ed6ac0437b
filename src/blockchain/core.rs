//! `chain` holds blocks and proof-of-work links, `state` the wallet and UTXO
//! projection, `validation` the block-level checks run before a commit.
pub mod chain;
pub mod state;
pub mod validation;

pub use chain::*;
pub use state::*;
pub use validation::*;
