//! Pending transaction pool
//!
//! Entries keep their arrival number for their whole life, including after a
//! requeue, so mining order is always first-accepted first-mined.

use crate::amount::Amount;
use crate::blockchain::Ledger;
use crate::crypto::WalletId;
use crate::error::ChainError;
use crate::transaction::{Transaction, TxKind};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Default cap on pending entries.
pub const DEFAULT_MAX_MEMPOOL_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub transaction: Transaction,
    pub arrival: u64,
    /// Times this entry lost an input race during block assembly.
    pub conflicts: u8,
}

#[derive(Debug, Clone)]
pub struct Mempool {
    entries: BTreeMap<u64, MempoolEntry>,
    arrival_by_id: HashMap<String, u64>,
    /// Authorization digest of each pending transfer.
    arrival_by_authorization: HashMap<String, u64>,
    next_arrival: u64,
    max_size: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_MEMPOOL_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Mempool {
            entries: BTreeMap::new(),
            arrival_by_id: HashMap::new(),
            arrival_by_authorization: HashMap::new(),
            next_arrival: 0,
            max_size,
        }
    }

    /// Admission: structure, signature and spendability against the current
    /// ledger snapshot. Acceptance is optimistic; inputs are re-checked when
    /// the transaction is assembled into a block.
    pub fn submit(
        &mut self,
        tx: Transaction,
        ledger: &Ledger,
        minimum_amount: Amount,
    ) -> Result<u64, ChainError> {
        if matches!(tx.kind, TxKind::MiningReward) {
            return Err(ChainError::InvalidTransaction(
                "Mining rewards are created by the miner only".to_string(),
            ));
        }
        if self.arrival_by_id.contains_key(&tx.tx_id) {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction {} is already pending",
                tx.tx_id
            )));
        }
        let authorization = tx.authorization_digest();
        if let Some(digest) = &authorization {
            if self.arrival_by_authorization.contains_key(digest) {
                return Err(ChainError::InvalidSignature(
                    "Transfer authorization is already pending".to_string(),
                ));
            }
        }
        if self.entries.len() >= self.max_size {
            return Err(ChainError::InvalidTransaction(format!(
                "Mempool is full ({} transactions)",
                self.max_size
            )));
        }

        tx.validate(ledger, minimum_amount)?;

        let arrival = self.next_arrival;
        self.next_arrival += 1;
        debug!(tx_id = %tx.tx_id, arrival, "transaction admitted to mempool");
        self.arrival_by_id.insert(tx.tx_id.clone(), arrival);
        if let Some(digest) = authorization {
            self.arrival_by_authorization.insert(digest, arrival);
        }
        self.entries.insert(
            arrival,
            MempoolEntry {
                transaction: tx,
                arrival,
                conflicts: 0,
            },
        );
        Ok(arrival)
    }

    /// Up to `max_count` entries in arrival order. Entries stay in the pool
    /// until they are removed after a successful commit.
    pub fn drain(&self, max_count: usize) -> Vec<MempoolEntry> {
        self.entries.values().take(max_count).cloned().collect()
    }

    /// Removes the given transactions, returning those that were present.
    pub fn remove(&mut self, tx_ids: &[String]) -> Vec<MempoolEntry> {
        tx_ids
            .iter()
            .filter_map(|id| {
                let arrival = self.arrival_by_id.remove(id)?;
                let entry = self.entries.remove(&arrival)?;
                if let Some(digest) = entry.transaction.authorization_digest() {
                    self.arrival_by_authorization.remove(&digest);
                }
                Some(entry)
            })
            .collect()
    }

    /// Puts a conflicted entry back at its original position with a bumped
    /// conflict count.
    pub fn requeue(&mut self, mut entry: MempoolEntry) {
        entry.conflicts = entry.conflicts.saturating_add(1);
        self.arrival_by_id.insert(entry.transaction.tx_id.clone(), entry.arrival);
        if let Some(digest) = entry.transaction.authorization_digest() {
            self.arrival_by_authorization.insert(digest, entry.arrival);
        }
        self.entries.insert(entry.arrival, entry);
    }

    pub fn get(&self, tx_id: &str) -> Option<&MempoolEntry> {
        self.arrival_by_id.get(tx_id).and_then(|a| self.entries.get(a))
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.arrival_by_id.contains_key(tx_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending transactions in arrival order.
    pub fn pending(&self) -> Vec<Transaction> {
        self.entries.values().map(|e| e.transaction.clone()).collect()
    }

    pub fn pending_for(&self, wallet: &WalletId) -> Vec<Transaction> {
        self.entries
            .values()
            .filter(|e| e.transaction.involves(wallet))
            .map(|e| e.transaction.clone())
            .collect()
    }
}
