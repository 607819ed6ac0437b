use crate::crypto::WalletId;
use crate::error::ChainError;
use crate::transaction::Transaction;
use chrono::{DateTime, DurationRound, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::validation::verify_block_integrity;

pub type Sha256Hash = [u8; 32];

/// Genesis timestamp: 2023-01-01T00:00:00Z.
pub const GENESIS_TIMESTAMP_MS: i64 = 1_672_531_200_000;

/// Serializes 32-byte hashes as lowercase hex strings.
pub mod hex_hash {
    use super::Sha256Hash;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Sha256Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Sha256Hash, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut hash = [0u8; 32];
        hex::decode_to_slice(&s, &mut hash).map_err(de::Error::custom)?;
        Ok(hash)
    }
}

pub fn parse_hash(hash_hex: &str) -> Result<Sha256Hash, ChainError> {
    let mut hash = [0u8; 32];
    hex::decode_to_slice(hash_hex, &mut hash)
        .map_err(|e| ChainError::NotFound(format!("'{}' is not a block hash: {}", hash_hex, e)))?;
    Ok(hash)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub index: u64,
    #[serde(with = "hex_hash")]
    pub previous_hash: Sha256Hash,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "hex_hash")]
    pub merkle_root: Sha256Hash,
    pub nonce: u64,
    pub difficulty: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.previous_hash);
        hasher.update(self.timestamp.timestamp_millis().to_le_bytes());
        hasher.update(self.merkle_root);
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.difficulty.to_le_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(flatten)]
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub miner: Option<WalletId>,
    #[serde(with = "hex_hash")]
    pub hash: Sha256Hash,
}

impl Block {
    /// An unmined block: nonce 0, hash computed for that nonce.
    pub fn new(
        index: u64,
        previous_hash: Sha256Hash,
        difficulty: u32,
        transactions: Vec<Transaction>,
        miner: Option<WalletId>,
    ) -> Self {
        let now = Utc::now();
        let timestamp = now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now);
        let merkle_root = Block::calculate_merkle_root(&transactions);
        let header = BlockHeader {
            index,
            previous_hash,
            timestamp,
            merkle_root,
            nonce: 0,
            difficulty,
        };
        let hash = header.hash();
        Block {
            header,
            transactions,
            miner,
            hash,
        }
    }

    /// The fixed sentinel every chain starts from.
    pub fn genesis() -> Self {
        let header = BlockHeader {
            index: 0,
            previous_hash: [0u8; 32],
            timestamp: Utc
                .timestamp_millis_opt(GENESIS_TIMESTAMP_MS)
                .single()
                .unwrap_or_default(),
            merkle_root: Block::calculate_merkle_root(&[]),
            nonce: 0,
            difficulty: 0,
        };
        let hash = header.hash();
        Block {
            header,
            transactions: Vec::new(),
            miner: None,
            hash,
        }
    }

    pub fn compute_hash(&self) -> Sha256Hash {
        self.header.hash()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Pairwise SHA-256 over transaction ids; an odd node is promoted
    /// unchanged, an empty list yields all zeros.
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Sha256Hash {
        if transactions.is_empty() {
            return [0u8; 32];
        }

        let mut level: Vec<Sha256Hash> = transactions.iter().map(Transaction::id_bytes).collect();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    if pair.len() == 1 {
                        return pair[0];
                    }
                    let mut hasher = Sha256::new();
                    hasher.update(pair[0]);
                    hasher.update(pair[1]);
                    hasher.finalize().into()
                })
                .collect();
        }
        level[0]
    }
}

/// Append-only, hash-linked sequence of blocks.
#[derive(Debug, Clone)]
pub struct ChainStore {
    blocks: Vec<Block>,
    index_by_hash: HashMap<Sha256Hash, usize>,
}

impl Default for ChainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore {
    pub fn new() -> Self {
        let genesis = Block::genesis();
        let mut index_by_hash = HashMap::new();
        index_by_hash.insert(genesis.hash, 0);
        ChainStore {
            blocks: vec![genesis],
            index_by_hash,
        }
    }

    /// Restores a stored chain, re-checking every block.
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self, ChainError> {
        let mut iter = blocks.into_iter();
        match iter.next() {
            Some(first) if first == Block::genesis() => {}
            Some(_) => {
                return Err(ChainError::ConsistencyFault(
                    "Stored chain does not start with the genesis block".to_string(),
                ))
            }
            None => return Ok(Self::new()),
        }

        let mut chain = Self::new();
        for block in iter {
            chain.append(block)?;
        }
        Ok(chain)
    }

    /// Appends a block. Any mismatch with the head means the single-writer
    /// invariant broke and is reported as a consistency fault.
    pub fn append(&mut self, block: Block) -> Result<(), ChainError> {
        let head = self.latest();
        if block.header.index != head.header.index + 1 {
            return Err(ChainError::ConsistencyFault(format!(
                "Block index {} does not follow head index {}",
                block.header.index, head.header.index
            )));
        }
        if block.header.previous_hash != head.hash {
            return Err(ChainError::ConsistencyFault(format!(
                "Block {} links to {}, head is {}",
                block.header.index,
                hex::encode(block.header.previous_hash),
                head.hash_hex()
            )));
        }
        verify_block_integrity(&block)
            .map_err(|e| ChainError::ConsistencyFault(format!("Block {}: {}", block.header.index, e)))?;

        self.index_by_hash.insert(block.hash, self.blocks.len());
        self.blocks.push(block);
        Ok(())
    }

    pub fn latest(&self) -> &Block {
        // The chain always holds at least the genesis block.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn get_all(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get_by_hash(&self, hash: &Sha256Hash) -> Option<&Block> {
        self.index_by_hash.get(hash).map(|&i| &self.blocks[i])
    }

    pub fn get_by_index(&self, index: u64) -> Option<&Block> {
        self.blocks.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Re-checks every block: recomputed hash, proof-of-work, merkle root
    /// and linkage to its predecessor.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.blocks.first() != Some(&Block::genesis()) {
            return Err(ChainError::ConsistencyFault("Genesis block mismatch".to_string()));
        }
        for pair in self.blocks.windows(2) {
            let (prev, block) = (&pair[0], &pair[1]);
            if block.header.index != prev.header.index + 1 || block.header.previous_hash != prev.hash {
                return Err(ChainError::ConsistencyFault(format!(
                    "Block {} is not linked to block {}",
                    block.header.index, prev.header.index
                )));
            }
            verify_block_integrity(block)
                .map_err(|e| ChainError::ConsistencyFault(format!("Block {}: {}", block.header.index, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::mine_block;
    use tokio_util::sync::CancellationToken;

    fn mined_child(chain: &ChainStore, difficulty: u32) -> Block {
        let head = chain.latest();
        let block = Block::new(head.header.index + 1, head.hash, difficulty, Vec::new(), None);
        mine_block(block, &CancellationToken::new(), 1_000).unwrap()
    }

    #[test]
    fn test_genesis_is_fixed() {
        let a = Block::genesis();
        let b = Block::genesis();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.header.index, 0);
        assert_eq!(a.header.previous_hash, [0u8; 32]);
        assert!(a.transactions.is_empty());
        assert_eq!(a.header.timestamp.timestamp_millis(), GENESIS_TIMESTAMP_MS);
    }

    #[test]
    fn test_append_and_lookup() {
        let mut chain = ChainStore::new();
        let block = mined_child(&chain, 1);
        let hash = block.hash;
        chain.append(block).unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.latest().hash, hash);
        assert_eq!(chain.get_by_hash(&hash).unwrap().header.index, 1);
        assert!(chain.validate().is_ok());
    }

    #[test]
    fn test_append_rejects_bad_linkage() {
        let mut chain = ChainStore::new();
        let mut block = Block::new(1, [7u8; 32], 0, Vec::new(), None);
        block.hash = block.compute_hash();
        assert!(matches!(chain.append(block), Err(ChainError::ConsistencyFault(_))));

        let genesis_hash = chain.latest().hash;
        let skipped = Block::new(2, genesis_hash, 0, Vec::new(), None);
        assert!(matches!(chain.append(skipped), Err(ChainError::ConsistencyFault(_))));
    }

    #[test]
    fn test_append_rejects_tampered_hash() {
        let mut chain = ChainStore::new();
        let mut block = mined_child(&chain, 1);
        block.header.nonce += 1;
        assert!(chain.append(block).is_err());
    }

    #[test]
    fn test_from_blocks_round_trip() {
        let mut chain = ChainStore::new();
        let block = mined_child(&chain, 1);
        chain.append(block).unwrap();

        let json = serde_json::to_string(chain.get_all()).unwrap();
        let blocks: Vec<Block> = serde_json::from_str(&json).unwrap();
        let restored = ChainStore::from_blocks(blocks).unwrap();
        assert_eq!(restored.latest().hash, chain.latest().hash);
    }

    #[test]
    fn test_merkle_root_odd_node_promoted() {
        assert_eq!(Block::calculate_merkle_root(&[]), [0u8; 32]);

        let txs: Vec<Transaction> = (0..3)
            .map(|i| {
                Transaction::mining_reward(
                    WalletId::from("miner"),
                    crate::amount::Amount::from_coins(1),
                    i,
                    Utc::now(),
                )
            })
            .collect();
        let ids: Vec<Sha256Hash> = txs.iter().map(Transaction::id_bytes).collect();

        let mut hasher = Sha256::new();
        hasher.update(ids[0]);
        hasher.update(ids[1]);
        let left: Sha256Hash = hasher.finalize().into();
        let mut hasher = Sha256::new();
        hasher.update(left);
        hasher.update(ids[2]);
        let expected: Sha256Hash = hasher.finalize().into();

        assert_eq!(Block::calculate_merkle_root(&txs), expected);
        assert_eq!(Block::calculate_merkle_root(&txs[..1]), ids[0]);
    }
}
