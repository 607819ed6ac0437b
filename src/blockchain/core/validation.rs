use crate::error::ChainError;
use crate::miner::meets_difficulty;
use crate::transaction::TxKind;
use std::collections::HashMap;

use super::chain::Block;

pub fn validate_no_double_spend(block: &Block) -> Result<(), ChainError> {
    let mut seen_inputs = HashMap::new();
    for tx in &block.transactions {
        for outpoint in tx.input_outpoints() {
            if let Some(conflicting_tx) = seen_inputs.get(&outpoint) {
                return Err(ChainError::DoubleSpendDetected(format!(
                    "UTXO {} is spent by both {} and {}",
                    outpoint, conflicting_tx, tx.tx_id
                )));
            }
            seen_inputs.insert(outpoint, tx.tx_id.clone());
        }
    }
    Ok(())
}

/// Checks a block on its own: stored hash, proof-of-work, merkle root, no
/// intra-block double spend, and at most one leading mining reward.
pub fn verify_block_integrity(block: &Block) -> Result<(), ChainError> {
    let recomputed = block.compute_hash();
    if recomputed != block.hash {
        return Err(ChainError::InvalidTransaction(format!(
            "Stored hash {} does not match recomputed {}",
            block.hash_hex(),
            hex::encode(recomputed)
        )));
    }

    if !meets_difficulty(&block.hash, block.header.difficulty) {
        return Err(ChainError::InvalidTransaction(format!(
            "Hash {} does not meet difficulty {}",
            block.hash_hex(),
            block.header.difficulty
        )));
    }

    let expected_merkle_root = Block::calculate_merkle_root(&block.transactions);
    if expected_merkle_root != block.header.merkle_root {
        return Err(ChainError::InvalidTransaction(format!(
            "Merkle root mismatch. Expected {}, but got {}.",
            hex::encode(expected_merkle_root),
            hex::encode(block.header.merkle_root)
        )));
    }

    for (i, tx) in block.transactions.iter().enumerate() {
        if i > 0 && matches!(tx.kind, TxKind::MiningReward) {
            return Err(ChainError::InvalidTransaction(
                "Mining reward must be the first transaction of a block".to_string(),
            ));
        }
    }

    validate_no_double_spend(block)
}
