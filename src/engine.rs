//! Ledger engine
//!
//! Owns the chain, the UTXO ledger and the mempool. Chain and ledger sit
//! behind one lock so a block commit replaces both at once; readers always
//! see a matching pair. Lock order is state, then mempool.
//!
//! Only one mining run may be active. The proof-of-work search runs without
//! holding any lock, so admissions and queries continue while a block is
//! being mined.

use crate::amount::Amount;
use crate::audit::{AuditLog, LogStatus, SystemLog, TransactionLog, TxAction};
use crate::blockchain::{parse_hash, Block, ChainStore, Ledger, Utxo, Wallet};
use crate::config::Config;
use crate::crypto::WalletId;
use crate::error::ChainError;
use crate::mempool::{Mempool, MempoolEntry, DEFAULT_MAX_MEMPOOL_SIZE};
use crate::miner::mine_block;
use crate::persistence::Persistence;
use crate::transaction::{Transaction, TxKind, TxStatus};
use crate::zakat::ZakatBook;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime parameters, resolved from [`Config`] into ledger units.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub difficulty: u32,
    pub max_batch: usize,
    pub block_reward: Amount,
    pub allow_empty_blocks: bool,
    pub cancel_check_interval: u64,
    pub default_miner: Option<WalletId>,
    pub initial_grant: Amount,
    pub minimum_transfer: Amount,
    pub zakat_rate_basis_points: u32,
    pub zakat_minimum_balance: Amount,
    pub pool_wallet: WalletId,
    pub mempool_capacity: usize,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self, ChainError> {
        Ok(EngineSettings {
            difficulty: config.mining.difficulty,
            max_batch: config.mining.max_batch,
            block_reward: config.block_reward()?,
            allow_empty_blocks: config.mining.allow_empty_blocks,
            cancel_check_interval: config.mining.cancel_check_interval,
            default_miner: config.mining.default_miner_wallet.as_deref().map(WalletId::from),
            initial_grant: config.initial_grant()?,
            minimum_transfer: config.minimum_transfer()?,
            zakat_rate_basis_points: config.zakat.rate_basis_points,
            zakat_minimum_balance: config.minimum_balance()?,
            pool_wallet: WalletId::new(config.zakat.pool_wallet_id.clone()),
            mempool_capacity: DEFAULT_MAX_MEMPOOL_SIZE,
        })
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        let config = Config::default();
        EngineSettings {
            difficulty: config.mining.difficulty,
            max_batch: config.mining.max_batch,
            block_reward: Amount::ZERO,
            allow_empty_blocks: false,
            cancel_check_interval: config.mining.cancel_check_interval,
            default_miner: None,
            initial_grant: Amount::from_coins(100),
            minimum_transfer: Amount::from_units(1_000_000),
            zakat_rate_basis_points: config.zakat.rate_basis_points,
            zakat_minimum_balance: Amount::ZERO,
            pool_wallet: WalletId::new(config.zakat.pool_wallet_id),
            mempool_capacity: DEFAULT_MAX_MEMPOOL_SIZE,
        }
    }
}

/// A signed transfer as submitted by a client. The sender is the
/// authenticated wallet; its registered key verifies the signature.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransferRequest {
    #[serde(rename = "receiverWalletId")]
    pub receiver: WalletId,
    pub amount: Amount,
    #[serde(default)]
    pub note: String,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
}

#[derive(Debug, Clone)]
pub enum MineOutcome {
    Mined(Block),
    /// Nothing eligible was pending; no search was started.
    NoWorkAvailable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MiningStatus {
    pub is_mining: bool,
    pub pending_transactions: usize,
    pub current_difficulty: u32,
    pub latest_block_index: u64,
    pub latest_block_hash: String,
    pub blocks_mined: u64,
    pub halted: Option<String>,
    pub persistence_fault: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub direction: Direction,
    pub block_index: Option<u64>,
}

struct ChainState {
    chain: ChainStore,
    ledger: Ledger,
}

/// Clears the mining flag when a run ends, however it ends.
struct MiningGuard<'a>(&'a AtomicBool);

impl Drop for MiningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct LedgerEngine {
    settings: EngineSettings,
    state: RwLock<ChainState>,
    mempool: Mutex<Mempool>,
    audit: AuditLog,
    zakat: ZakatBook,
    persistence: Arc<dyn Persistence>,
    mining: AtomicBool,
    cancel: Mutex<CancellationToken>,
    halted: RwLock<Option<String>>,
    blocks_mined: AtomicU64,
    persistence_fault: Mutex<Option<String>>,
    /// Index of the first block the store has not accepted yet.
    unsaved_from: AtomicU64,
}

impl LedgerEngine {
    /// Restores the stored chain, or starts a fresh one from genesis.
    pub fn open(settings: EngineSettings, persistence: Arc<dyn Persistence>) -> Result<Self, ChainError> {
        let now = Utc::now();
        let (chain, mut ledger, mut unsaved_from) = match persistence.load_chain()? {
            Some((blocks, ledger)) => {
                let chain = ChainStore::from_blocks(blocks)?;
                info!(height = chain.len(), wallets = ledger.wallets().count(), "restored chain from storage");
                let next = chain.latest().header.index + 1;
                (chain, ledger, next)
            }
            None => {
                info!("no stored chain, starting from genesis");
                (ChainStore::new(), Ledger::new(), 0)
            }
        };

        if unsaved_from == 0 || !ledger.contains_wallet(&settings.pool_wallet) {
            ledger.ensure_system_wallet(&settings.pool_wallet, now);
            persistence.save_commit(&blocks_from(&chain, unsaved_from), &ledger)?;
            unsaved_from = chain.latest().header.index + 1;
        }

        let audit = AuditLog::open(persistence.clone())?;
        let zakat = ZakatBook::open(persistence.clone())?;

        Ok(LedgerEngine {
            mempool: Mutex::new(Mempool::with_capacity(settings.mempool_capacity)),
            settings,
            state: RwLock::new(ChainState { chain, ledger }),
            audit,
            zakat,
            persistence,
            mining: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            halted: RwLock::new(None),
            blocks_mined: AtomicU64::new(0),
            persistence_fault: Mutex::new(None),
            unsaved_from: AtomicU64::new(unsaved_from),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn zakat_book(&self) -> &ZakatBook {
        &self.zakat
    }

    // ------------------------------------------------------------------
    // Wallets
    // ------------------------------------------------------------------

    /// Registers a wallet for a public key and credits the configured grant.
    pub fn register_wallet(&self, public_key_hex: &str) -> Result<Wallet, ChainError> {
        self.surface_persistence_fault()?;
        let wallet = {
            let mut state = self.state.write();
            let genesis_hash = state.chain.get_by_index(0).map(Block::hash_hex).unwrap_or_default();
            let wallet =
                state
                    .ledger
                    .register_wallet(public_key_hex, self.settings.initial_grant, &genesis_hash, Utc::now())?;
            self.persist_state("wallet registration", &state);
            wallet
        };

        self.audit.record_system(
            SystemLog::new(
                "wallet_registered",
                format!("Wallet created with grant {}", self.settings.initial_grant),
                LogStatus::Success,
            )
            .with_wallet(&wallet.wallet_id),
        );
        Ok(wallet)
    }

    /// Returns the user wallet for this key, registering it when absent.
    /// An existing wallet is handed back as is, without a second grant.
    pub fn open_wallet(&self, public_key_hex: &str) -> Result<Wallet, ChainError> {
        let wallet_id = WalletId::from_public_key_hex(&public_key_hex.to_lowercase());
        if let Some(existing) = self.wallet(&wallet_id) {
            if existing.is_system {
                return Err(ChainError::InvalidTransaction(format!(
                    "Wallet {} is reserved",
                    wallet_id
                )));
            }
            info!(wallet = %wallet_id, "attaching existing wallet");
            return Ok(existing);
        }
        self.register_wallet(public_key_hex)
    }

    pub fn wallet(&self, wallet_id: &WalletId) -> Option<Wallet> {
        self.state.read().ledger.wallet(wallet_id).cloned()
    }

    pub fn wallet_exists(&self, wallet_id: &WalletId) -> bool {
        self.state.read().ledger.contains_wallet(wallet_id)
    }

    /// Confirmed balance: the sum of the wallet's unspent outputs.
    pub fn balance_of(&self, wallet_id: &WalletId) -> Result<Amount, ChainError> {
        let state = self.state.read();
        if !state.ledger.contains_wallet(wallet_id) {
            return Err(ChainError::UnknownWallet(wallet_id.to_string()));
        }
        Ok(state.ledger.balance_of(wallet_id))
    }

    pub fn utxos_of(&self, wallet_id: &WalletId) -> Result<Vec<Utxo>, ChainError> {
        let state = self.state.read();
        if !state.ledger.contains_wallet(wallet_id) {
            return Err(ChainError::UnknownWallet(wallet_id.to_string()));
        }
        Ok(state.ledger.utxos_of(wallet_id))
    }

    /// User wallets other than the collection wallet, with confirmed balances.
    pub fn zakat_candidates(&self) -> Vec<(WalletId, Amount)> {
        let state = self.state.read();
        let mut candidates: Vec<(WalletId, Amount)> = state
            .ledger
            .wallets()
            .filter(|w| !w.is_system && w.wallet_id != self.settings.pool_wallet)
            .map(|w| (w.wallet_id.clone(), state.ledger.balance_of(&w.wallet_id)))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        candidates
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Admits a transfer signed by `sender` to the mempool. Inputs are
    /// chosen oldest first from the sender's confirmed outputs.
    pub fn submit_transfer(&self, sender: &WalletId, request: TransferRequest) -> Result<Transaction, ChainError> {
        self.surface_persistence_fault()?;
        let public_key = {
            let state = self.state.read();
            let wallet = state
                .ledger
                .wallet(sender)
                .ok_or_else(|| ChainError::UnknownWallet(sender.to_string()))?;
            wallet.public_key.clone().ok_or_else(|| {
                ChainError::InvalidTransaction(format!("Wallet {} cannot sign transfers", sender))
            })?
        };
        let mut tx = Transaction::transfer(
            sender.clone(),
            public_key,
            request.receiver,
            request.amount,
            request.note,
            request.timestamp,
            request.signature,
        );

        let admitted = tx.validate_signature().and_then(|_| self.admit(&mut tx));
        match admitted {
            Ok(()) => {
                self.audit.record_transaction(
                    TransactionLog::new(tx.tx_id.clone(), TxAction::Sent, tx.amount, LogStatus::Success)
                        .with_wallet(tx.sender.as_ref())
                        .with_note("accepted into mempool"),
                );
                Ok(tx)
            }
            Err(e) => {
                self.audit.record_transaction(
                    TransactionLog::new(tx.tx_id.clone(), TxAction::Rejected, tx.amount, LogStatus::Error)
                        .with_wallet(tx.sender.as_ref())
                        .with_note(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Admits a zakat levy on `payer` for `period`.
    pub(crate) fn submit_zakat(&self, payer: &WalletId, amount: Amount, period: &str) -> Result<Transaction, ChainError> {
        let mut tx = Transaction::zakat_deduction(
            payer.clone(),
            self.settings.pool_wallet.clone(),
            amount,
            period.to_string(),
            Utc::now(),
        );
        self.admit(&mut tx)?;
        self.audit.record_transaction(
            TransactionLog::new(tx.tx_id.clone(), TxAction::ZakatDeducted, tx.amount, LogStatus::Success)
                .with_wallet(Some(payer))
                .with_note(format!("pending deduction for {}", period)),
        );
        Ok(tx)
    }

    fn admit(&self, tx: &mut Transaction) -> Result<(), ChainError> {
        let state = self.state.read();
        let debited = tx
            .debited_wallet()
            .cloned()
            .ok_or_else(|| ChainError::InvalidTransaction("transaction has no debited wallet".to_string()))?;
        let inputs = state.ledger.select_inputs(&debited, tx.amount)?;
        tx.fund_from(&inputs)?;

        let mut mempool = self.mempool.lock();
        mempool.submit(tx.clone(), &state.ledger, self.settings.minimum_transfer)?;
        Ok(())
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.mempool.lock().pending()
    }

    pub fn pending_for(&self, wallet_id: &WalletId) -> Vec<Transaction> {
        self.mempool.lock().pending_for(wallet_id)
    }

    // ------------------------------------------------------------------
    // Mining
    // ------------------------------------------------------------------

    pub fn is_mining(&self) -> bool {
        self.mining.load(Ordering::Acquire)
    }

    /// Cancels the active proof-of-work search, if any.
    pub fn cancel_mining(&self) {
        if self.is_mining() {
            info!("cancelling active mining run");
        }
        self.cancel.lock().cancel();
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halted.read().clone()
    }

    /// Raises the mining flag and installs the run's token under the cancel
    /// lock, so a `cancel_mining` either precedes the run or reaches it.
    fn begin_mining(&self) -> Result<(MiningGuard<'_>, CancellationToken), ChainError> {
        let mut current = self.cancel.lock();
        self.mining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChainError::AlreadyMining)?;
        let cancel = CancellationToken::new();
        *current = cancel.clone();
        Ok((MiningGuard(&self.mining), cancel))
    }

    /// Assembles, mines and commits one block from the pending pool.
    pub fn mine(&self, miner: Option<WalletId>) -> Result<MineOutcome, ChainError> {
        let (_guard, cancel) = self.begin_mining()?;
        if let Some(reason) = self.halt_reason() {
            return Err(ChainError::ConsistencyFault(format!("mining is halted: {}", reason)));
        }

        let batch = self.mempool.lock().drain(self.settings.max_batch);
        if batch.is_empty() && !self.settings.allow_empty_blocks {
            debug!("mempool empty, nothing to mine");
            return Ok(MineOutcome::NoWorkAvailable);
        }

        let miner = miner.or_else(|| self.settings.default_miner.clone());
        let now = Utc::now();
        let (height, previous_hash, mut scratch) = {
            let state = self.state.read();
            let head = state.chain.latest();
            (head.header.index + 1, head.hash, state.ledger.clone())
        };

        // Sequential re-validation against a scratch ledger: an entry whose
        // inputs an earlier entry of the same batch consumed is set aside.
        let mut eligible: Vec<MempoolEntry> = Vec::new();
        let mut conflicted: Vec<(MempoolEntry, ChainError)> = Vec::new();
        let mut discarded: Vec<(MempoolEntry, ChainError)> = Vec::new();
        for entry in batch {
            let tx = &entry.transaction;
            let checked = tx
                .validate_structure(self.settings.minimum_transfer)
                .and_then(|_| tx.validate_signature())
                .and_then(|_| scratch.apply_transaction(tx, "", now));
            match checked {
                Ok(()) => eligible.push(entry),
                Err(e) if e.is_structural() => discarded.push((entry, e)),
                Err(e) => conflicted.push((entry, e)),
            }
        }

        if eligible.is_empty() && !self.settings.allow_empty_blocks {
            self.settle_rejected(conflicted, discarded);
            return Ok(MineOutcome::NoWorkAvailable);
        }

        let mut transactions = Vec::with_capacity(eligible.len() + 1);
        if let Some(reward) = self.reward_for(miner.as_ref(), &scratch, height, now) {
            transactions.push(reward);
        }
        transactions.extend(eligible.iter().map(|e| e.transaction.clone()));

        let candidate = Block::new(height, previous_hash, self.settings.difficulty, transactions, miner);
        info!(
            index = height,
            transactions = candidate.transactions.len(),
            difficulty = self.settings.difficulty,
            "mining block"
        );
        let started = std::time::Instant::now();
        let mut block = mine_block(candidate, &cancel, self.settings.cancel_check_interval)?;

        let block_hash = block.hash_hex();
        for tx in &mut block.transactions {
            tx.status = TxStatus::Confirmed;
            tx.block_hash = Some(block_hash.clone());
        }

        self.commit(&block)?;

        let mined_ids: Vec<String> = eligible.iter().map(|e| e.transaction.tx_id.clone()).collect();
        self.mempool.lock().remove(&mined_ids);
        self.settle_rejected(conflicted, discarded);
        self.record_confirmed(&block);

        let mined = self.blocks_mined.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            index = block.header.index,
            hash = %block_hash,
            nonce = block.header.nonce,
            elapsed_ms = started.elapsed().as_millis() as u64,
            blocks_mined = mined,
            "block committed"
        );
        Ok(MineOutcome::Mined(block))
    }

    fn reward_for(
        &self,
        miner: Option<&WalletId>,
        ledger: &Ledger,
        height: u64,
        now: DateTime<Utc>,
    ) -> Option<Transaction> {
        if self.settings.block_reward.is_zero() {
            return None;
        }
        let miner = miner?;
        if !ledger.contains_wallet(miner) {
            warn!(miner = %miner, "miner wallet unknown, block reward skipped");
            return None;
        }
        Some(Transaction::mining_reward(miner.clone(), self.settings.block_reward, height, now))
    }

    /// Applies the block to the live state. Any failure here means the
    /// single-writer invariant broke; mining halts until an operator looks.
    fn commit(&self, block: &Block) -> Result<(), ChainError> {
        let mut state = self.state.write();
        let staged = match state.ledger.stage_block(block) {
            Ok(staged) => staged,
            Err(e) => return Err(self.halt(format!("block {} failed to apply: {}", block.header.index, e))),
        };
        if let Err(e) = state.chain.append(block.clone()) {
            return Err(self.halt(format!("block {} rejected by chain: {}", block.header.index, e)));
        }
        state.ledger = staged;
        self.persist_state("block commit", &state);
        Ok(())
    }

    fn halt(&self, reason: String) -> ChainError {
        error!(reason = %reason, "ledger consistency fault, mining halted");
        *self.halted.write() = Some(reason.clone());
        self.audit
            .record_system(SystemLog::new("mining_halted", reason.clone(), LogStatus::Error));
        ChainError::ConsistencyFault(reason)
    }

    /// Conflicted entries get one retry with inputs re-derived from the new
    /// ledger; a second conflict, or a sender who can no longer cover the
    /// amount, drops them. Structural failures are dropped outright.
    fn settle_rejected(&self, conflicted: Vec<(MempoolEntry, ChainError)>, discarded: Vec<(MempoolEntry, ChainError)>) {
        if conflicted.is_empty() && discarded.is_empty() {
            return;
        }

        let state = self.state.read();
        let mut mempool = self.mempool.lock();
        let mut dropped: Vec<(Transaction, String)> = Vec::new();

        for (entry, reason) in discarded {
            mempool.remove(&[entry.transaction.tx_id.clone()]);
            dropped.push((entry.transaction, reason.to_string()));
        }

        for (entry, reason) in conflicted {
            let Some(mut entry) = mempool.remove(&[entry.transaction.tx_id.clone()]).pop() else {
                continue;
            };
            if entry.conflicts > 0 {
                dropped.push((entry.transaction, format!("conflicted twice: {}", reason)));
                continue;
            }

            let rederived = entry
                .transaction
                .debited_wallet()
                .cloned()
                .ok_or_else(|| ChainError::InvalidTransaction("no debited wallet".to_string()))
                .and_then(|debited| state.ledger.select_inputs(&debited, entry.transaction.amount))
                .and_then(|inputs| entry.transaction.fund_from(&inputs))
                .and_then(|_| entry.transaction.validate_with_state(&state.ledger));

            match rederived {
                Ok(()) => {
                    self.audit.record_transaction(
                        TransactionLog::new(
                            entry.transaction.tx_id.clone(),
                            TxAction::Requeued,
                            entry.transaction.amount,
                            LogStatus::Error,
                        )
                        .with_wallet(entry.transaction.debited_wallet())
                        .with_note(reason.to_string()),
                    );
                    mempool.requeue(entry);
                }
                Err(e) => dropped.push((entry.transaction, format!("{}; retry failed: {}", reason, e))),
            }
        }
        drop(mempool);
        drop(state);

        for (tx, reason) in dropped {
            warn!(tx_id = %tx.tx_id, reason = %reason, "transaction discarded from mempool");
            if let TxKind::ZakatDeduction { payer, period } = &tx.kind {
                self.zakat.release(payer, period);
            }
            self.audit.record_transaction(
                TransactionLog::new(tx.tx_id.clone(), TxAction::Discarded, tx.amount, LogStatus::Error)
                    .with_wallet(tx.debited_wallet())
                    .with_note(reason),
            );
        }
    }

    fn record_confirmed(&self, block: &Block) {
        let block_hash = block.hash_hex();
        for tx in &block.transactions {
            let log = |action, wallet: Option<&WalletId>| {
                self.audit.record_transaction(
                    TransactionLog::new(tx.tx_id.clone(), action, tx.amount, LogStatus::Success)
                        .with_wallet(wallet)
                        .with_block(block_hash.clone())
                        .with_note(tx.note.clone()),
                );
            };
            match &tx.kind {
                TxKind::Transfer => {
                    log(TxAction::Sent, tx.sender.as_ref());
                    log(TxAction::Received, Some(&tx.receiver));
                }
                TxKind::ZakatDeduction { payer, .. } => {
                    self.zakat.record_confirmed(tx, &block_hash);
                    log(TxAction::ZakatDeducted, Some(payer));
                    log(TxAction::Received, Some(&tx.receiver));
                }
                TxKind::MiningReward => log(TxAction::Mined, Some(&tx.receiver)),
            }
        }

        let mut entry = SystemLog::new(
            "block_mined",
            format!(
                "Block {} mined with {} transactions",
                block.header.index,
                block.transactions.len()
            ),
            LogStatus::Success,
        );
        if let Some(miner) = &block.miner {
            entry = entry.with_wallet(miner);
        }
        self.audit.record_system(entry);
    }

    pub fn mining_status(&self) -> MiningStatus {
        let (latest_block_index, latest_block_hash) = {
            let state = self.state.read();
            let head = state.chain.latest();
            (head.header.index, head.hash_hex())
        };
        MiningStatus {
            is_mining: self.is_mining(),
            pending_transactions: self.mempool.lock().len(),
            current_difficulty: self.settings.difficulty,
            latest_block_index,
            latest_block_hash,
            blocks_mined: self.blocks_mined.load(Ordering::Relaxed),
            halted: self.halt_reason(),
            persistence_fault: self.persistence_fault.lock().clone(),
        }
    }

    // ------------------------------------------------------------------
    // Chain queries
    // ------------------------------------------------------------------

    /// Newest first.
    pub fn blocks(&self, limit: usize) -> Vec<Block> {
        self.state.read().chain.get_all().iter().rev().take(limit).cloned().collect()
    }

    pub fn chain_height(&self) -> usize {
        self.state.read().chain.len()
    }

    pub fn latest_block(&self) -> Block {
        self.state.read().chain.latest().clone()
    }

    pub fn block_by_hash(&self, hash_hex: &str) -> Result<Block, ChainError> {
        let hash = parse_hash(hash_hex)?;
        self.state
            .read()
            .chain
            .get_by_hash(&hash)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("block {}", hash_hex)))
    }

    /// Re-verifies every block and the ledger projection.
    pub fn validate_chain(&self) -> Result<(), ChainError> {
        let state = self.state.read();
        state.chain.validate()?;
        state.ledger.verify_consistency()
    }

    /// Confirmed transactions touching the wallet, newest first.
    pub fn history(&self, wallet_id: &WalletId, limit: usize) -> Result<Vec<HistoryEntry>, ChainError> {
        let state = self.state.read();
        if !state.ledger.contains_wallet(wallet_id) {
            return Err(ChainError::UnknownWallet(wallet_id.to_string()));
        }

        let entries = state
            .chain
            .get_all()
            .iter()
            .rev()
            .flat_map(|block| {
                block
                    .transactions
                    .iter()
                    .rev()
                    .map(move |tx| (block.header.index, tx))
            })
            .filter(|(_, tx)| tx.involves(wallet_id))
            .take(limit)
            .map(|(index, tx)| HistoryEntry {
                direction: if tx.debited_wallet() == Some(wallet_id) {
                    Direction::Sent
                } else {
                    Direction::Received
                },
                transaction: tx.clone(),
                block_index: Some(index),
            })
            .collect();
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Persistence faults
    // ------------------------------------------------------------------

    /// Memory stays authoritative when a write fails; the fault is reported
    /// to the next mutating caller.
    fn persist<F>(&self, what: &str, write: F) -> bool
    where
        F: FnOnce() -> Result<(), ChainError>,
    {
        match write() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, operation = what, "persistence write failed");
                *self.persistence_fault.lock() = Some(format!("{} failed: {}", what, e));
                false
            }
        }
    }

    /// Writes the ledger along with every block the store is missing, so a
    /// write after a failed one closes the gap. Callers hold the state lock.
    fn persist_state(&self, what: &str, state: &ChainState) {
        let from = self.unsaved_from.load(Ordering::Acquire);
        let unsaved = blocks_from(&state.chain, from);
        if !unsaved.is_empty() {
            debug!(from, count = unsaved.len(), "persisting blocks");
        }
        if self.persist(what, || self.persistence.save_commit(&unsaved, &state.ledger)) {
            self.unsaved_from
                .store(state.chain.latest().header.index + 1, Ordering::Release);
        }
    }

    fn surface_persistence_fault(&self) -> Result<(), ChainError> {
        match self.persistence_fault.lock().take() {
            Some(fault) => Err(ChainError::DatabaseError(fault)),
            None => Ok(()),
        }
    }
}

fn blocks_from(chain: &ChainStore, from: u64) -> Vec<Block> {
    chain
        .get_all()
        .iter()
        .filter(|b| b.header.index >= from)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::persistence::InMemoryPersistence;

    fn settings() -> EngineSettings {
        EngineSettings {
            difficulty: 1,
            ..EngineSettings::default()
        }
    }

    fn engine() -> LedgerEngine {
        LedgerEngine::open(settings(), Arc::new(InMemoryPersistence::new())).unwrap()
    }

    fn request(from: &KeyPair, to: &WalletId, amount: Amount) -> TransferRequest {
        let timestamp = Utc::now();
        TransferRequest {
            receiver: to.clone(),
            amount,
            note: String::new(),
            timestamp,
            signature: from.sign_transfer(to, amount, &timestamp, "").unwrap(),
        }
    }

    fn register(engine: &LedgerEngine) -> (KeyPair, WalletId) {
        let keypair = KeyPair::generate();
        let wallet = engine.register_wallet(&keypair.public_key_hex()).unwrap();
        (keypair, wallet.wallet_id)
    }

    #[test]
    fn test_empty_mempool_yields_no_work() {
        let engine = engine();
        assert!(matches!(engine.mine(None).unwrap(), MineOutcome::NoWorkAvailable));
        assert_eq!(engine.chain_height(), 1);
        assert!(!engine.is_mining());
    }

    #[test]
    fn test_transfer_mined_and_balances_move() {
        let engine = engine();
        let (alice, a) = register(&engine);
        let (_, b) = register(&engine);

        engine.submit_transfer(&alice.wallet_id(), request(&alice, &b, Amount::from_coins(30))).unwrap();
        assert_eq!(engine.pending().len(), 1);

        let block = match engine.mine(None).unwrap() {
            MineOutcome::Mined(block) => block,
            MineOutcome::NoWorkAvailable => panic!("expected a block"),
        };
        assert_eq!(block.header.index, 1);
        assert!(engine.pending().is_empty());
        assert_eq!(engine.balance_of(&a).unwrap(), Amount::from_coins(70));
        assert_eq!(engine.balance_of(&b).unwrap(), Amount::from_coins(130));
        assert!(engine.validate_chain().is_ok());

        let history = engine.history(&a, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].direction, Direction::Sent);
        assert_eq!(history[0].transaction.status, TxStatus::Confirmed);
    }

    #[test]
    fn test_competing_spends_one_confirmed_one_requeued() {
        let engine = engine();
        let (alice, a) = register(&engine);
        let (_, b) = register(&engine);

        // Both select the single 100-coin grant output.
        let first = engine.submit_transfer(&alice.wallet_id(), request(&alice, &b, Amount::from_coins(60))).unwrap();
        let second = engine.submit_transfer(&alice.wallet_id(), request(&alice, &b, Amount::from_coins(30))).unwrap();

        match engine.mine(None).unwrap() {
            MineOutcome::Mined(block) => {
                assert_eq!(block.transactions.len(), 1);
                assert_eq!(block.transactions[0].tx_id, first.tx_id);
            }
            MineOutcome::NoWorkAvailable => panic!("expected a block"),
        }
        let pending = engine.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tx_id, second.tx_id);

        engine.mine(None).unwrap();
        assert_eq!(engine.balance_of(&a).unwrap(), Amount::from_coins(10));
        assert!(engine.pending().is_empty());
    }

    #[test]
    fn test_conflict_without_funds_is_discarded() {
        let engine = engine();
        let (alice, a) = register(&engine);
        let (_, b) = register(&engine);

        engine.submit_transfer(&alice.wallet_id(), request(&alice, &b, Amount::from_coins(80))).unwrap();
        engine.submit_transfer(&alice.wallet_id(), request(&alice, &b, Amount::from_coins(50))).unwrap();
        engine.mine(None).unwrap();

        assert!(engine.pending().is_empty());
        assert_eq!(engine.balance_of(&a).unwrap(), Amount::from_coins(20));
        let discarded = engine
            .audit()
            .transaction_logs(Some(&a), 20)
            .into_iter()
            .filter(|l| l.action == TxAction::Discarded)
            .count();
        assert_eq!(discarded, 1);
    }

    #[test]
    fn test_concurrent_mining_rejected() {
        let engine = engine();
        let _held = engine.begin_mining().unwrap();
        assert!(matches!(engine.mine(None), Err(ChainError::AlreadyMining)));
    }

    #[test]
    fn test_simultaneous_mine_calls_produce_one_block() {
        let engine = LedgerEngine::open(
            EngineSettings {
                difficulty: 5,
                ..EngineSettings::default()
            },
            Arc::new(InMemoryPersistence::new()),
        )
        .unwrap();
        let (alice, a) = register(&engine);
        let (_, b) = register(&engine);
        engine
            .submit_transfer(&a, request(&alice, &b, Amount::from_coins(10)))
            .unwrap();

        let engine = Arc::new(engine);
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    engine.mine(None)
                })
            })
            .collect();
        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        let mined = results
            .iter()
            .filter(|r| matches!(r, Ok(MineOutcome::Mined(_))))
            .count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(ChainError::AlreadyMining)))
            .count();
        assert_eq!(mined, 1);
        assert_eq!(refused, 1);
        assert_eq!(engine.chain_height(), 2);
        assert_eq!(engine.balance_of(&a).unwrap(), Amount::from_coins(90));
        assert!(!engine.is_mining());
    }

    #[test]
    fn test_cancel_right_after_start_reaches_the_run() {
        let engine = engine();
        let (_guard, token) = engine.begin_mining().unwrap();
        engine.cancel_mining();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancelled_search_leaves_state_untouched() {
        let engine = LedgerEngine::open(
            EngineSettings {
                difficulty: 64,
                cancel_check_interval: 1,
                ..EngineSettings::default()
            },
            Arc::new(InMemoryPersistence::new()),
        )
        .unwrap();
        let (alice, _) = register(&engine);
        let (_, b) = register(&engine);
        engine.submit_transfer(&alice.wallet_id(), request(&alice, &b, Amount::from_coins(1))).unwrap();

        let engine = Arc::new(engine);
        let worker = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.mine(None))
        };
        // A cancel issued before the run starts hits the previous token.
        // Keep cancelling until the worker gives up.
        while !worker.is_finished() {
            engine.cancel_mining();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let result = worker.join().unwrap();
        assert!(matches!(result, Err(ChainError::MiningCancelled)));
        assert_eq!(engine.chain_height(), 1);
        assert_eq!(engine.pending().len(), 1);
    }

    #[test]
    fn test_block_reward_paid_to_miner() {
        let engine = LedgerEngine::open(
            EngineSettings {
                difficulty: 1,
                block_reward: Amount::from_coins(5),
                ..EngineSettings::default()
            },
            Arc::new(InMemoryPersistence::new()),
        )
        .unwrap();
        let (alice, a) = register(&engine);
        let (_, b) = register(&engine);
        engine.submit_transfer(&alice.wallet_id(), request(&alice, &b, Amount::from_coins(10))).unwrap();

        engine.mine(Some(b.clone())).unwrap();
        assert_eq!(engine.balance_of(&b).unwrap(), Amount::from_coins(115));
        assert_eq!(engine.balance_of(&a).unwrap(), Amount::from_coins(90));
        assert!(engine.validate_chain().is_ok());
    }

    #[test]
    fn test_restart_restores_chain_and_balances() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let (a, b) = {
            let engine = LedgerEngine::open(settings(), persistence.clone()).unwrap();
            let (alice, a) = register(&engine);
            let (_, b) = register(&engine);
            engine.submit_transfer(&alice.wallet_id(), request(&alice, &b, Amount::from_coins(25))).unwrap();
            engine.mine(None).unwrap();
            (a, b)
        };

        let reopened = LedgerEngine::open(settings(), persistence).unwrap();
        assert_eq!(reopened.chain_height(), 2);
        assert_eq!(reopened.balance_of(&a).unwrap(), Amount::from_coins(75));
        assert_eq!(reopened.balance_of(&b).unwrap(), Amount::from_coins(125));
        assert!(reopened.validate_chain().is_ok());
    }

    #[test]
    fn test_persistence_fault_surfaces_once() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let engine = LedgerEngine::open(settings(), persistence.clone()).unwrap();

        persistence.set_fail_writes(true);
        let first = KeyPair::generate();
        assert!(engine.register_wallet(&first.public_key_hex()).is_ok());
        persistence.set_fail_writes(false);

        let second = KeyPair::generate();
        assert!(matches!(
            engine.register_wallet(&second.public_key_hex()),
            Err(ChainError::DatabaseError(_))
        ));
        assert!(engine.register_wallet(&second.public_key_hex()).is_ok());
    }

    #[test]
    fn test_signed_transfer_moves_funds_once() {
        let engine = engine();
        let (alice, a) = register(&engine);
        let (_, b) = register(&engine);
        let signed = request(&alice, &b, Amount::from_coins(10));

        engine.submit_transfer(&a, signed.clone()).unwrap();
        assert!(matches!(
            engine.submit_transfer(&a, signed.clone()),
            Err(ChainError::InvalidSignature(_))
        ));
        engine.mine(None).unwrap();

        for _ in 0..2 {
            assert!(matches!(
                engine.submit_transfer(&a, signed.clone()),
                Err(ChainError::InvalidSignature(_))
            ));
            assert!(matches!(engine.mine(None).unwrap(), MineOutcome::NoWorkAvailable));
        }
        assert_eq!(engine.balance_of(&a).unwrap(), Amount::from_coins(90));
        assert_eq!(engine.balance_of(&b).unwrap(), Amount::from_coins(110));
    }

    #[test]
    fn test_used_authorization_survives_restart() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let (alice, a, b, signed) = {
            let engine = LedgerEngine::open(settings(), persistence.clone()).unwrap();
            let (alice, a) = register(&engine);
            let (_, b) = register(&engine);
            let signed = request(&alice, &b, Amount::from_coins(10));
            engine.submit_transfer(&a, signed.clone()).unwrap();
            engine.mine(None).unwrap();
            (alice, a, b, signed)
        };

        let reopened = LedgerEngine::open(settings(), persistence).unwrap();
        assert!(matches!(
            reopened.submit_transfer(&a, signed),
            Err(ChainError::InvalidSignature(_))
        ));
        assert!(reopened
            .submit_transfer(&a, request(&alice, &b, Amount::from_coins(11)))
            .is_ok());
    }

    #[test]
    fn test_signature_checked_against_registered_key() {
        let engine = engine();
        let (alice, _) = register(&engine);
        let (_, b) = register(&engine);
        let (_, c) = register(&engine);

        // Alice's signature submitted as Bob.
        let result = engine.submit_transfer(&b, request(&alice, &c, Amount::from_coins(5)));
        assert!(matches!(result, Err(ChainError::InvalidSignature(_))));

        let unknown = KeyPair::generate();
        assert!(matches!(
            engine.submit_transfer(&unknown.wallet_id(), request(&unknown, &c, Amount::from_coins(5))),
            Err(ChainError::UnknownWallet(_))
        ));
        let pool = engine.settings().pool_wallet.clone();
        assert!(matches!(
            engine.submit_transfer(&pool, request(&alice, &c, Amount::from_coins(5))),
            Err(ChainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_store_catches_up_after_failed_block_write() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let (a, b) = {
            let engine = LedgerEngine::open(settings(), persistence.clone()).unwrap();
            let (alice, a) = register(&engine);
            let (_, b) = register(&engine);
            engine
                .submit_transfer(&a, request(&alice, &b, Amount::from_coins(10)))
                .unwrap();

            persistence.set_fail_writes(true);
            assert!(matches!(engine.mine(None).unwrap(), MineOutcome::Mined(_)));
            persistence.set_fail_writes(false);
            assert!(engine.mining_status().persistence_fault.is_some());

            let next = request(&alice, &b, Amount::from_coins(5));
            assert!(matches!(
                engine.submit_transfer(&a, next.clone()),
                Err(ChainError::DatabaseError(_))
            ));
            engine.submit_transfer(&a, next).unwrap();
            assert!(matches!(engine.mine(None).unwrap(), MineOutcome::Mined(_)));
            (a, b)
        };

        let reopened = LedgerEngine::open(settings(), persistence).unwrap();
        assert_eq!(reopened.chain_height(), 3);
        assert_eq!(reopened.balance_of(&a).unwrap(), Amount::from_coins(85));
        assert_eq!(reopened.balance_of(&b).unwrap(), Amount::from_coins(115));
        assert!(reopened.validate_chain().is_ok());
    }

    #[test]
    fn test_open_wallet_reattaches_without_second_grant() {
        let engine = engine();
        let keypair = KeyPair::generate();
        let first = engine.open_wallet(&keypair.public_key_hex()).unwrap();
        let again = engine.open_wallet(&keypair.public_key_hex().to_uppercase()).unwrap();
        assert_eq!(first.wallet_id, again.wallet_id);
        assert_eq!(engine.balance_of(&first.wallet_id).unwrap(), Amount::from_coins(100));
    }

    #[test]
    fn test_block_lookup_by_hash() {
        let engine = engine();
        let genesis = engine.latest_block();
        assert_eq!(engine.block_by_hash(&genesis.hash_hex()).unwrap(), genesis);
        assert!(matches!(
            engine.block_by_hash(&"ab".repeat(32)),
            Err(ChainError::NotFound(_))
        ));
    }
}
