//! Database persistence layer for ZakatChain

use crate::accounts::Account;
use crate::audit::{SystemLog, TransactionLog};
use crate::blockchain::{Block, Ledger, Utxo, Wallet};
use crate::crypto::WalletId;
use crate::error::ChainError;
use crate::zakat::ZakatRecord;
use rusqlite::{params, Connection, Transaction as SqlTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Abstraction for persistence backends. Implementations should provide
/// atomic saving/loading of the chain and the ledger projection.
pub trait Persistence: Send + Sync {
    /// Stores blocks, in index order, together with the full ledger
    /// projection in one atomic write. `blocks` may be empty when only the
    /// ledger changed.
    fn save_commit(&self, blocks: &[Block], ledger: &Ledger) -> Result<(), ChainError>;
    /// `None` when nothing has been stored yet.
    fn load_chain(&self) -> Result<Option<(Vec<Block>, Ledger)>, ChainError>;

    fn append_system_log(&self, entry: &SystemLog) -> Result<(), ChainError>;
    fn append_transaction_log(&self, entry: &TransactionLog) -> Result<(), ChainError>;
    fn load_system_logs(&self) -> Result<Vec<SystemLog>, ChainError>;
    fn load_transaction_logs(&self) -> Result<Vec<TransactionLog>, ChainError>;

    fn save_zakat_record(&self, record: &ZakatRecord) -> Result<(), ChainError>;
    fn load_zakat_records(&self) -> Result<Vec<ZakatRecord>, ChainError>;
    fn save_zakat_period(&self, wallet: &WalletId, period: &str) -> Result<(), ChainError>;
    fn clear_zakat_period(&self, wallet: &WalletId, period: &str) -> Result<(), ChainError>;
    fn load_zakat_periods(&self) -> Result<Vec<(WalletId, String)>, ChainError>;

    fn save_account(&self, account: &Account) -> Result<(), ChainError>;
    fn load_accounts(&self) -> Result<Vec<Account>, ChainError>;
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String, ChainError> {
    serde_json::to_string(value)
        .map_err(|e| ChainError::DatabaseError(format!("Failed to serialize {}: {}", what, e)))
}

fn from_json<T: DeserializeOwned>(json: &str, what: &str) -> Result<T, ChainError> {
    serde_json::from_str(json)
        .map_err(|e| ChainError::DatabaseError(format!("Failed to deserialize {}: {}", what, e)))
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (
                idx INTEGER PRIMARY KEY,
                hash TEXT NOT NULL UNIQUE,
                previous_hash TEXT NOT NULL,
                block_data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS wallets (
                wallet_id TEXT PRIMARY KEY,
                wallet_data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS utxo_set (
                outpoint TEXT PRIMARY KEY,
                wallet_id TEXT NOT NULL,
                utxo_data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS authorizations (
                digest TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS system_logs (
                id INTEGER PRIMARY KEY,
                entry_data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transaction_logs (
                id INTEGER PRIMARY KEY,
                entry_data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS zakat_records (
                tx_id TEXT PRIMARY KEY,
                record_data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS zakat_periods (
                wallet_id TEXT NOT NULL,
                period TEXT NOT NULL,
                PRIMARY KEY (wallet_id, period)
            );
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                account_data TEXT NOT NULL
            );",
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create tables: {}", e)))?;

        Ok(Database { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ChainError> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    fn write_block(tx: &SqlTransaction, block: &Block) -> Result<(), ChainError> {
        tx.execute(
            "INSERT OR REPLACE INTO blocks (idx, hash, previous_hash, block_data) VALUES (?1, ?2, ?3, ?4)",
            params![
                block.header.index as i64,
                block.hash_hex(),
                hex::encode(block.header.previous_hash),
                to_json(block, "block")?,
            ],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;
        Ok(())
    }

    fn write_ledger(tx: &SqlTransaction, ledger: &Ledger) -> Result<(), ChainError> {
        tx.execute("DELETE FROM wallets", [])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to clear wallets: {}", e)))?;
        tx.execute("DELETE FROM utxo_set", [])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to clear utxo_set: {}", e)))?;

        for wallet in ledger.wallets() {
            tx.execute(
                "INSERT INTO wallets (wallet_id, wallet_data) VALUES (?1, ?2)",
                params![wallet.wallet_id.as_str(), to_json(wallet, "wallet")?],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save wallet: {}", e)))?;
        }

        for utxo in ledger.utxos() {
            tx.execute(
                "INSERT INTO utxo_set (outpoint, wallet_id, utxo_data) VALUES (?1, ?2, ?3)",
                params![utxo.outpoint.to_string(), utxo.wallet_id.as_str(), to_json(utxo, "UTXO")?],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save UTXO: {}", e)))?;
        }

        // Authorizations only ever grow.
        for digest in ledger.authorizations() {
            tx.execute(
                "INSERT OR IGNORE INTO authorizations (digest) VALUES (?1)",
                params![digest],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save authorization: {}", e)))?;
        }
        Ok(())
    }

    fn load_authorizations(&self) -> Result<Vec<String>, ChainError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT digest FROM authorizations")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query authorizations: {}", e)))?;

        let mut digests = Vec::new();
        for row in rows {
            digests.push(row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?);
        }
        Ok(digests)
    }

    fn load_column<T: DeserializeOwned>(&self, sql: &str, what: &str) -> Result<Vec<T>, ChainError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query {}: {}", what, e)))?;

        let mut items = Vec::new();
        for row in rows {
            let json = row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            items.push(from_json(&json, what)?);
        }
        Ok(items)
    }
}

impl Persistence for Database {
    fn save_commit(&self, blocks: &[Block], ledger: &Ledger) -> Result<(), ChainError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;

        for block in blocks {
            Self::write_block(&tx, block)?;
        }
        Self::write_ledger(&tx, ledger)?;

        // Commit all changes atomically
        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;
        Ok(())
    }

    fn load_chain(&self) -> Result<Option<(Vec<Block>, Ledger)>, ChainError> {
        let blocks: Vec<Block> = self.load_column("SELECT block_data FROM blocks ORDER BY idx ASC", "block")?;
        let wallets: Vec<Wallet> = self.load_column("SELECT wallet_data FROM wallets", "wallet")?;
        let utxos: Vec<Utxo> = self.load_column("SELECT utxo_data FROM utxo_set", "UTXO")?;

        if blocks.is_empty() && wallets.is_empty() && utxos.is_empty() {
            return Ok(None);
        }
        let authorizations = self.load_authorizations()?;
        Ok(Some((blocks, Ledger::from_parts(wallets, utxos, authorizations)?)))
    }

    fn append_system_log(&self, entry: &SystemLog) -> Result<(), ChainError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO system_logs (id, entry_data) VALUES (?1, ?2)",
                params![entry.id as i64, to_json(entry, "system log")?],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save system log: {}", e)))?;
        Ok(())
    }

    fn append_transaction_log(&self, entry: &TransactionLog) -> Result<(), ChainError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO transaction_logs (id, entry_data) VALUES (?1, ?2)",
                params![entry.id as i64, to_json(entry, "transaction log")?],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save transaction log: {}", e)))?;
        Ok(())
    }

    fn load_system_logs(&self) -> Result<Vec<SystemLog>, ChainError> {
        self.load_column("SELECT entry_data FROM system_logs ORDER BY id ASC", "system log")
    }

    fn load_transaction_logs(&self) -> Result<Vec<TransactionLog>, ChainError> {
        self.load_column("SELECT entry_data FROM transaction_logs ORDER BY id ASC", "transaction log")
    }

    fn save_zakat_record(&self, record: &ZakatRecord) -> Result<(), ChainError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO zakat_records (tx_id, record_data) VALUES (?1, ?2)",
                params![record.tx_id, to_json(record, "zakat record")?],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save zakat record: {}", e)))?;
        Ok(())
    }

    fn load_zakat_records(&self) -> Result<Vec<ZakatRecord>, ChainError> {
        let mut records: Vec<ZakatRecord> =
            self.load_column("SELECT record_data FROM zakat_records", "zakat record")?;
        records.sort_by_key(|r| r.date);
        Ok(records)
    }

    fn save_zakat_period(&self, wallet: &WalletId, period: &str) -> Result<(), ChainError> {
        self.conn()?
            .execute(
                "INSERT OR IGNORE INTO zakat_periods (wallet_id, period) VALUES (?1, ?2)",
                params![wallet.as_str(), period],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save zakat period: {}", e)))?;
        Ok(())
    }

    fn clear_zakat_period(&self, wallet: &WalletId, period: &str) -> Result<(), ChainError> {
        self.conn()?
            .execute(
                "DELETE FROM zakat_periods WHERE wallet_id = ?1 AND period = ?2",
                params![wallet.as_str(), period],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to clear zakat period: {}", e)))?;
        Ok(())
    }

    fn load_zakat_periods(&self) -> Result<Vec<(WalletId, String)>, ChainError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT wallet_id, period FROM zakat_periods")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query zakat periods: {}", e)))?;

        let mut periods = Vec::new();
        for row in rows {
            let (wallet, period) =
                row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            periods.push((WalletId::new(wallet), period));
        }
        Ok(periods)
    }

    fn save_account(&self, account: &Account) -> Result<(), ChainError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO accounts (id, account_data) VALUES (?1, ?2)",
                params![account.id, to_json(account, "account")?],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save account: {}", e)))?;
        Ok(())
    }

    fn load_accounts(&self) -> Result<Vec<Account>, ChainError> {
        self.load_column("SELECT account_data FROM accounts", "account")
    }
}

#[derive(Default)]
struct MemoryStore {
    blocks: BTreeMap<u64, Block>,
    wallets: Vec<Wallet>,
    utxos: Vec<Utxo>,
    authorizations: Vec<String>,
    system_logs: Vec<SystemLog>,
    transaction_logs: Vec<TransactionLog>,
    zakat_records: HashMap<String, ZakatRecord>,
    zakat_periods: HashSet<(WalletId, String)>,
    accounts: HashMap<String, Account>,
}

impl MemoryStore {
    fn replace_ledger(&mut self, ledger: &Ledger) {
        self.wallets = ledger.wallets().cloned().collect();
        self.utxos = ledger.utxos().cloned().collect();
        self.authorizations = ledger.authorizations().cloned().collect();
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
/// Clones share the same store.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    store: Arc<Mutex<MemoryStore>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail, simulating an unavailable store.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read(&self) -> Result<std::sync::MutexGuard<'_, MemoryStore>, ChainError> {
        self.store
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::MutexGuard<'_, MemoryStore>, ChainError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChainError::DatabaseError("store is unavailable".to_string()));
        }
        self.read()
    }
}

impl Persistence for InMemoryPersistence {
    fn save_commit(&self, blocks: &[Block], ledger: &Ledger) -> Result<(), ChainError> {
        let mut store = self.write()?;
        for block in blocks {
            store.blocks.insert(block.header.index, block.clone());
        }
        store.replace_ledger(ledger);
        Ok(())
    }

    fn load_chain(&self) -> Result<Option<(Vec<Block>, Ledger)>, ChainError> {
        let store = self.read()?;
        if store.blocks.is_empty() && store.wallets.is_empty() && store.utxos.is_empty() {
            return Ok(None);
        }
        let blocks = store.blocks.values().cloned().collect();
        let ledger = Ledger::from_parts(
            store.wallets.clone(),
            store.utxos.clone(),
            store.authorizations.clone(),
        )?;
        Ok(Some((blocks, ledger)))
    }

    fn append_system_log(&self, entry: &SystemLog) -> Result<(), ChainError> {
        self.write()?.system_logs.push(entry.clone());
        Ok(())
    }

    fn append_transaction_log(&self, entry: &TransactionLog) -> Result<(), ChainError> {
        self.write()?.transaction_logs.push(entry.clone());
        Ok(())
    }

    fn load_system_logs(&self) -> Result<Vec<SystemLog>, ChainError> {
        Ok(self.read()?.system_logs.clone())
    }

    fn load_transaction_logs(&self) -> Result<Vec<TransactionLog>, ChainError> {
        Ok(self.read()?.transaction_logs.clone())
    }

    fn save_zakat_record(&self, record: &ZakatRecord) -> Result<(), ChainError> {
        self.write()?
            .zakat_records
            .insert(record.tx_id.clone(), record.clone());
        Ok(())
    }

    fn load_zakat_records(&self) -> Result<Vec<ZakatRecord>, ChainError> {
        let mut records: Vec<ZakatRecord> = self.read()?.zakat_records.values().cloned().collect();
        records.sort_by_key(|r| r.date);
        Ok(records)
    }

    fn save_zakat_period(&self, wallet: &WalletId, period: &str) -> Result<(), ChainError> {
        self.write()?
            .zakat_periods
            .insert((wallet.clone(), period.to_string()));
        Ok(())
    }

    fn clear_zakat_period(&self, wallet: &WalletId, period: &str) -> Result<(), ChainError> {
        self.write()?
            .zakat_periods
            .remove(&(wallet.clone(), period.to_string()));
        Ok(())
    }

    fn load_zakat_periods(&self) -> Result<Vec<(WalletId, String)>, ChainError> {
        Ok(self.read()?.zakat_periods.iter().cloned().collect())
    }

    fn save_account(&self, account: &Account) -> Result<(), ChainError> {
        self.write()?
            .accounts
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    fn load_accounts(&self) -> Result<Vec<Account>, ChainError> {
        Ok(self.read()?.accounts.values().cloned().collect())
    }
}
