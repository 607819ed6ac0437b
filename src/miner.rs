//! Proof-of-work nonce search
//!
//! Difficulty is the number of leading zero hex nibbles required in a block
//! hash. The search starts at nonce 0 and polls its cancellation token every
//! `check_interval` attempts.

use crate::blockchain::{Block, Sha256Hash};
use crate::error::ChainError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Number of leading zero hex characters in the hash.
pub fn leading_zero_nibbles(hash: &Sha256Hash) -> u32 {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

pub fn meets_difficulty(hash: &Sha256Hash, difficulty: u32) -> bool {
    leading_zero_nibbles(hash) >= difficulty
}

/// Searches nonces from zero until the block hash meets its declared
/// difficulty. Returns `MiningCancelled` once the token fires.
pub fn mine_block(
    mut block: Block,
    cancel: &CancellationToken,
    check_interval: u64,
) -> Result<Block, ChainError> {
    let check_interval = check_interval.max(1);
    let difficulty = block.header.difficulty;
    let mut nonce: u64 = 0;

    loop {
        if nonce % check_interval == 0 && cancel.is_cancelled() {
            debug!(index = block.header.index, attempts = nonce, "mining cancelled");
            return Err(ChainError::MiningCancelled);
        }

        block.header.nonce = nonce;
        let hash = block.header.hash();
        if meets_difficulty(&hash, difficulty) {
            block.hash = hash;
            debug!(index = block.header.index, nonce, "proof-of-work found");
            return Ok(block);
        }

        nonce = nonce
            .checked_add(1)
            .ok_or_else(|| ChainError::InvalidTransaction("nonce space exhausted".to_string()))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_zero_nibbles() {
        let mut hash = [0xffu8; 32];
        assert_eq!(leading_zero_nibbles(&hash), 0);
        hash[0] = 0x0f;
        assert_eq!(leading_zero_nibbles(&hash), 1);
        hash[0] = 0x00;
        hash[1] = 0x01;
        assert_eq!(leading_zero_nibbles(&hash), 3);
        assert_eq!(leading_zero_nibbles(&[0u8; 32]), 64);
    }

    #[test]
    fn test_mined_block_meets_difficulty() {
        let block = Block::new(1, [0u8; 32], 2, Vec::new(), None);
        let mined = mine_block(block, &CancellationToken::new(), 100).unwrap();
        assert_eq!(mined.hash, mined.compute_hash());
        assert!(hex::encode(mined.hash).starts_with("00"));
    }

    #[test]
    fn test_cancelled_token_stops_search() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // 64 nibbles is unreachable; only cancellation ends the search.
        let block = Block::new(1, [0u8; 32], 64, Vec::new(), None);
        assert!(matches!(
            mine_block(block, &cancel, 10),
            Err(ChainError::MiningCancelled)
        ));
    }
}
