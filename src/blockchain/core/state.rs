use crate::amount::Amount;
use crate::crypto::{parse_public_key, WalletId};
use crate::error::ChainError;
use crate::transaction::{OutPoint, Transaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::chain::Block;

/// Prefix of the outputs created for a wallet's registration grant.
pub const GRANT_TX_PREFIX: &str = "genesis_";

/// An unspent transaction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    #[serde(flatten)]
    pub outpoint: OutPoint,
    pub wallet_id: WalletId,
    pub amount: Amount,
    /// Hash of the block that created this output.
    pub block_hash: String,
    /// Ledger-wide creation order, used for oldest-first selection.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub wallet_id: WalletId,
    pub public_key: Option<String>,
    /// Projection of the UTXO set; refreshed on every applied block.
    #[serde(rename = "balance")]
    pub cached_balance: Amount,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The UTXO ledger: the only owner of spent/unspent state.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    utxo_set: HashMap<OutPoint, Utxo>,
    wallets: HashMap<WalletId, Wallet>,
    /// Digests of every confirmed transfer authorization. A signed request
    /// moves funds at most once.
    authorizations: HashSet<String>,
    next_sequence: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a ledger from stored rows and checks the cached balances.
    pub fn from_parts(
        wallets: Vec<Wallet>,
        utxos: Vec<Utxo>,
        authorizations: Vec<String>,
    ) -> Result<Self, ChainError> {
        let next_sequence = utxos.iter().map(|u| u.sequence + 1).max().unwrap_or(0);
        let ledger = Ledger {
            utxo_set: utxos.into_iter().map(|u| (u.outpoint.clone(), u)).collect(),
            wallets: wallets.into_iter().map(|w| (w.wallet_id.clone(), w)).collect(),
            authorizations: authorizations.into_iter().collect(),
            next_sequence,
        };
        ledger.verify_consistency()?;
        Ok(ledger)
    }

    pub fn wallet(&self, wallet_id: &WalletId) -> Option<&Wallet> {
        self.wallets.get(wallet_id)
    }

    pub fn contains_wallet(&self, wallet_id: &WalletId) -> bool {
        self.wallets.contains_key(wallet_id)
    }

    pub fn wallets(&self) -> impl Iterator<Item = &Wallet> {
        self.wallets.values()
    }

    pub fn utxos(&self) -> impl Iterator<Item = &Utxo> {
        self.utxo_set.values()
    }

    pub fn utxo_count(&self) -> usize {
        self.utxo_set.len()
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxo_set.get(outpoint)
    }

    pub fn is_authorization_used(&self, digest: &str) -> bool {
        self.authorizations.contains(digest)
    }

    pub fn authorizations(&self) -> impl Iterator<Item = &String> {
        self.authorizations.iter()
    }

    /// Creates a user wallet and, when `grant` is non-zero, its grant output.
    pub fn register_wallet(
        &mut self,
        public_key_hex: &str,
        grant: Amount,
        genesis_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Wallet, ChainError> {
        parse_public_key(public_key_hex)
            .map_err(|e| ChainError::InvalidTransaction(format!("Invalid public key: {}", e)))?;

        let public_key = public_key_hex.to_lowercase();
        let wallet_id = WalletId::from_public_key_hex(&public_key);
        if self.wallets.contains_key(&wallet_id) {
            return Err(ChainError::InvalidTransaction(format!(
                "Wallet {} is already registered",
                wallet_id
            )));
        }

        if !grant.is_zero() {
            let outpoint = OutPoint::new(format!("{}{}", GRANT_TX_PREFIX, wallet_id), 0);
            self.insert_utxo(outpoint, wallet_id.clone(), grant, genesis_hash, now);
        }

        let wallet = Wallet {
            wallet_id: wallet_id.clone(),
            public_key: Some(public_key),
            cached_balance: grant,
            is_system: false,
            created_at: now,
            updated_at: now,
        };
        self.wallets.insert(wallet_id, wallet.clone());
        Ok(wallet)
    }

    /// Creates a keyless system wallet if it does not exist yet.
    pub fn ensure_system_wallet(&mut self, wallet_id: &WalletId, now: DateTime<Utc>) {
        self.wallets.entry(wallet_id.clone()).or_insert_with(|| Wallet {
            wallet_id: wallet_id.clone(),
            public_key: None,
            cached_balance: Amount::ZERO,
            is_system: true,
            created_at: now,
            updated_at: now,
        });
    }

    /// Sum of the unspent outputs owned by the wallet.
    pub fn balance_of(&self, wallet_id: &WalletId) -> Amount {
        let units = self
            .utxo_set
            .values()
            .filter(|u| &u.wallet_id == wallet_id)
            .fold(0u64, |acc, u| acc.saturating_add(u.amount.units()));
        Amount::from_units(units)
    }

    pub fn cached_balance(&self, wallet_id: &WalletId) -> Option<Amount> {
        self.wallets.get(wallet_id).map(|w| w.cached_balance)
    }

    /// Unspent outputs of a wallet, oldest first.
    pub fn utxos_of(&self, wallet_id: &WalletId) -> Vec<Utxo> {
        let mut utxos: Vec<Utxo> = self
            .utxo_set
            .values()
            .filter(|u| &u.wallet_id == wallet_id)
            .cloned()
            .collect();
        utxos.sort_by_key(|u| u.sequence);
        utxos
    }

    /// Oldest-first selection covering at least `amount`.
    pub fn select_inputs(&self, wallet_id: &WalletId, amount: Amount) -> Result<Vec<Utxo>, ChainError> {
        if !self.wallets.contains_key(wallet_id) {
            return Err(ChainError::UnknownWallet(wallet_id.to_string()));
        }

        let mut selected = Vec::new();
        let mut covered = Amount::ZERO;
        for utxo in self.utxos_of(wallet_id) {
            if covered >= amount {
                break;
            }
            covered = covered.checked_add(utxo.amount).unwrap_or(covered);
            selected.push(utxo);
        }

        if covered < amount {
            return Err(ChainError::InsufficientFunds {
                available: covered.to_string(),
                required: amount.to_string(),
            });
        }
        Ok(selected)
    }

    fn insert_utxo(
        &mut self,
        outpoint: OutPoint,
        wallet_id: WalletId,
        amount: Amount,
        block_hash: &str,
        created_at: DateTime<Utc>,
    ) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.utxo_set.insert(
            outpoint.clone(),
            Utxo {
                outpoint,
                wallet_id,
                amount,
                block_hash: block_hash.to_string(),
                sequence,
                created_at,
            },
        );
    }

    fn credit(&mut self, wallet_id: &WalletId, amount: Amount, now: DateTime<Utc>) {
        if let Some(wallet) = self.wallets.get_mut(wallet_id) {
            wallet.cached_balance = wallet.cached_balance.checked_add(amount).unwrap_or(wallet.cached_balance);
            wallet.updated_at = now;
        }
    }

    fn debit(&mut self, wallet_id: &WalletId, amount: Amount, now: DateTime<Utc>) {
        if let Some(wallet) = self.wallets.get_mut(wallet_id) {
            wallet.cached_balance = wallet.cached_balance.saturating_sub(amount);
            wallet.updated_at = now;
        }
    }

    /// Spends the inputs and creates the outputs of one transaction. Callers
    /// needing atomicity run this on a clone.
    pub fn apply_transaction(
        &mut self,
        tx: &Transaction,
        block_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), ChainError> {
        tx.validate_with_state(self)?;

        if let Some(debited) = tx.debited_wallet().cloned() {
            for outpoint in tx.input_outpoints() {
                let spent = self.utxo_set.remove(&outpoint).ok_or_else(|| {
                    ChainError::DoubleSpendDetected(format!("Input {} is not unspent", outpoint))
                })?;
                self.debit(&debited, spent.amount, created_at);
            }
        }

        for output in &tx.outputs {
            let outpoint = OutPoint::new(tx.tx_id.clone(), output.index);
            if self.utxo_set.contains_key(&outpoint) {
                return Err(ChainError::InvalidTransaction(format!(
                    "Output {} already exists",
                    outpoint
                )));
            }
            self.insert_utxo(outpoint, output.wallet_id.clone(), output.amount, block_hash, created_at);
            self.credit(&output.wallet_id, output.amount, created_at);
        }
        if let Some(digest) = tx.authorization_digest() {
            self.authorizations.insert(digest);
        }
        Ok(())
    }

    /// Applies every transaction of a block to a copy of the ledger. The copy
    /// is returned only when all of them applied and the balances agree.
    pub fn stage_block(&self, block: &Block) -> Result<Ledger, ChainError> {
        let mut staged = self.clone();
        let block_hash = block.hash_hex();
        for tx in &block.transactions {
            staged.apply_transaction(tx, &block_hash, block.header.timestamp)?;
        }
        staged.verify_consistency()?;
        Ok(staged)
    }

    /// All-or-nothing block application.
    pub fn apply_block(&mut self, block: &Block) -> Result<(), ChainError> {
        *self = self.stage_block(block)?;
        Ok(())
    }

    /// Checks that every cached balance equals the sum of the wallet's outputs
    /// and that no output belongs to an unknown wallet.
    pub fn verify_consistency(&self) -> Result<(), ChainError> {
        let mut sums: HashMap<&WalletId, u64> = HashMap::new();
        for utxo in self.utxo_set.values() {
            if !self.wallets.contains_key(&utxo.wallet_id) {
                return Err(ChainError::ConsistencyFault(format!(
                    "Output {} belongs to unknown wallet {}",
                    utxo.outpoint, utxo.wallet_id
                )));
            }
            let entry = sums.entry(&utxo.wallet_id).or_insert(0);
            *entry = entry.saturating_add(utxo.amount.units());
        }

        for wallet in self.wallets.values() {
            let actual = Amount::from_units(sums.get(&wallet.wallet_id).copied().unwrap_or(0));
            if actual != wallet.cached_balance {
                return Err(ChainError::ConsistencyFault(format!(
                    "Wallet {} caches {} but owns {}",
                    wallet.wallet_id, wallet.cached_balance, actual
                )));
            }
        }
        Ok(())
    }
}
