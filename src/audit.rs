//! Audit log: append-only system and transaction event streams.
//!
//! Every entry is kept in memory for queries, written through to the
//! persistence backend and mirrored to tracing.

use crate::amount::Amount;
use crate::crypto::WalletId;
use crate::error::ChainError;
use crate::persistence::Persistence;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemLog {
    pub id: u64,
    pub action: String,
    pub user_id: Option<String>,
    pub wallet_id: Option<WalletId>,
    pub details: String,
    pub ip_address: Option<String>,
    pub status: LogStatus,
    pub timestamp: DateTime<Utc>,
}

impl SystemLog {
    pub fn new(action: impl Into<String>, details: impl Into<String>, status: LogStatus) -> Self {
        SystemLog {
            id: 0,
            action: action.into(),
            user_id: None,
            wallet_id: None,
            details: details.into(),
            ip_address: None,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_wallet(mut self, wallet_id: &WalletId) -> Self {
        self.wallet_id = Some(wallet_id.clone());
        self
    }

    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxAction {
    Sent,
    Received,
    Mined,
    ZakatDeducted,
    Rejected,
    Requeued,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLog {
    pub id: u64,
    pub tx_id: String,
    pub action: TxAction,
    pub wallet_id: Option<WalletId>,
    pub amount: Amount,
    pub block_hash: Option<String>,
    pub status: LogStatus,
    pub note: String,
    pub timestamp: DateTime<Utc>,
}

impl TransactionLog {
    pub fn new(tx_id: impl Into<String>, action: TxAction, amount: Amount, status: LogStatus) -> Self {
        TransactionLog {
            id: 0,
            tx_id: tx_id.into(),
            action,
            wallet_id: None,
            amount,
            block_hash: None,
            status,
            note: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_wallet(mut self, wallet_id: Option<&WalletId>) -> Self {
        self.wallet_id = wallet_id.cloned();
        self
    }

    pub fn with_block(mut self, block_hash: impl Into<String>) -> Self {
        self.block_hash = Some(block_hash.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }
}

pub struct AuditLog {
    system: RwLock<Vec<SystemLog>>,
    transactions: RwLock<Vec<TransactionLog>>,
    next_id: AtomicU64,
    persistence: Arc<dyn Persistence>,
}

impl AuditLog {
    /// Opens the log, reloading previously stored entries.
    pub fn open(persistence: Arc<dyn Persistence>) -> Result<Self, ChainError> {
        let system = persistence.load_system_logs()?;
        let transactions = persistence.load_transaction_logs()?;
        let next_id = system
            .iter()
            .map(|e| e.id)
            .chain(transactions.iter().map(|e| e.id))
            .max()
            .map_or(1, |id| id + 1);

        Ok(AuditLog {
            system: RwLock::new(system),
            transactions: RwLock::new(transactions),
            next_id: AtomicU64::new(next_id),
            persistence,
        })
    }

    pub fn record_system(&self, mut entry: SystemLog) {
        entry.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match entry.status {
            LogStatus::Success => info!(
                target: "audit",
                action = %entry.action,
                wallet = ?entry.wallet_id.as_ref().map(|w| w.as_str()),
                "{}", entry.details
            ),
            LogStatus::Error => warn!(
                target: "audit",
                action = %entry.action,
                wallet = ?entry.wallet_id.as_ref().map(|w| w.as_str()),
                "{}", entry.details
            ),
        }
        if let Err(e) = self.persistence.append_system_log(&entry) {
            error!(error = %e, action = %entry.action, "failed to persist system log");
        }
        self.system.write().push(entry);
    }

    pub fn record_transaction(&self, mut entry: TransactionLog) {
        entry.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match entry.status {
            LogStatus::Success => info!(
                target: "audit",
                tx_id = %entry.tx_id,
                action = ?entry.action,
                amount = %entry.amount,
                "{}", entry.note
            ),
            LogStatus::Error => warn!(
                target: "audit",
                tx_id = %entry.tx_id,
                action = ?entry.action,
                amount = %entry.amount,
                "{}", entry.note
            ),
        }
        if let Err(e) = self.persistence.append_transaction_log(&entry) {
            error!(error = %e, tx_id = %entry.tx_id, "failed to persist transaction log");
        }
        self.transactions.write().push(entry);
    }

    /// Newest first.
    pub fn system_logs(&self, limit: usize) -> Vec<SystemLog> {
        self.system.read().iter().rev().take(limit).cloned().collect()
    }

    /// Newest first; `None` returns every wallet's entries.
    pub fn transaction_logs(&self, wallet: Option<&WalletId>, limit: usize) -> Vec<TransactionLog> {
        self.transactions
            .read()
            .iter()
            .rev()
            .filter(|e| wallet.map_or(true, |w| e.wallet_id.as_ref() == Some(w)))
            .take(limit)
            .cloned()
            .collect()
    }
}
