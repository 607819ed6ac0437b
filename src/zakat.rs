//! Zakat scheduler
//!
//! A run charges every eligible wallet `rate_bp / 10000` of its confirmed
//! balance through the normal mempool admission path. A `(wallet, period)`
//! marker is taken before submission, so a wallet is charged at most once per
//! calendar month; the marker is released if the charge never confirms. The
//! [`ZakatRecord`] itself is written when the deduction is mined.

use crate::amount::Amount;
use crate::audit::{LogStatus, SystemLog};
use crate::crypto::WalletId;
use crate::engine::LedgerEngine;
use crate::error::ChainError;
use crate::persistence::Persistence;
use crate::transaction::{Transaction, TxKind};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZakatRecord {
    pub wallet_id: WalletId,
    pub amount: Amount,
    pub period: String,
    pub tx_id: String,
    pub block_hash: String,
    pub date: DateTime<Utc>,
}

/// Period key (`YYYY-MM`, UTC) for an instant.
pub fn period_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Midnight UTC on the first day of the month after `now`.
pub fn next_run_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Charged amount, rounded down to the minimum unit.
pub fn zakat_due(balance: Amount, rate_basis_points: u32) -> Amount {
    balance.basis_points(rate_basis_points)
}

/// Processed-period markers and confirmed records.
pub struct ZakatBook {
    periods: Mutex<HashSet<(WalletId, String)>>,
    records: RwLock<Vec<ZakatRecord>>,
    persistence: Arc<dyn Persistence>,
}

impl ZakatBook {
    /// Loads the book. Markers whose deduction never confirmed belonged to
    /// transactions lost with the previous mempool and are released.
    pub fn open(persistence: Arc<dyn Persistence>) -> Result<Self, ChainError> {
        let records = persistence.load_zakat_records()?;
        let mut periods = HashSet::new();
        for (wallet, period) in persistence.load_zakat_periods()? {
            if records.iter().any(|r| r.wallet_id == wallet && r.period == period) {
                periods.insert((wallet, period));
            } else {
                persistence.clear_zakat_period(&wallet, &period)?;
            }
        }

        Ok(ZakatBook {
            periods: Mutex::new(periods),
            records: RwLock::new(records),
            persistence,
        })
    }

    pub fn is_processed(&self, wallet: &WalletId, period: &str) -> bool {
        self.periods.lock().contains(&(wallet.clone(), period.to_string()))
    }

    /// Takes the marker; `false` if the wallet was already charged for the period.
    pub fn try_mark(&self, wallet: &WalletId, period: &str) -> Result<bool, ChainError> {
        let mut periods = self.periods.lock();
        let key = (wallet.clone(), period.to_string());
        if periods.contains(&key) {
            return Ok(false);
        }
        self.persistence.save_zakat_period(wallet, period)?;
        periods.insert(key);
        Ok(true)
    }

    pub fn release(&self, wallet: &WalletId, period: &str) {
        self.periods.lock().remove(&(wallet.clone(), period.to_string()));
        if let Err(e) = self.persistence.clear_zakat_period(wallet, period) {
            error!(error = %e, wallet = %wallet, period, "failed to clear zakat period");
        }
    }

    /// Writes the record for a mined deduction.
    pub fn record_confirmed(&self, tx: &Transaction, block_hash: &str) -> Option<ZakatRecord> {
        let (payer, period) = match &tx.kind {
            TxKind::ZakatDeduction { payer, period } => (payer.clone(), period.clone()),
            _ => return None,
        };
        let record = ZakatRecord {
            wallet_id: payer,
            amount: tx.amount,
            period,
            tx_id: tx.tx_id.clone(),
            block_hash: block_hash.to_string(),
            date: Utc::now(),
        };
        if let Err(e) = self.persistence.save_zakat_record(&record) {
            error!(error = %e, tx_id = %record.tx_id, "failed to persist zakat record");
        }
        self.records.write().push(record.clone());
        Some(record)
    }

    /// Newest first; `None` returns every wallet's records.
    pub fn records(&self, wallet: Option<&WalletId>) -> Vec<ZakatRecord> {
        self.records
            .read()
            .iter()
            .rev()
            .filter(|r| wallet.map_or(true, |w| &r.wallet_id == w))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZakatCharge {
    pub wallet_id: WalletId,
    pub balance: Amount,
    pub amount: Amount,
    pub tx_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZakatFailure {
    pub wallet_id: WalletId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZakatRunReport {
    pub period: String,
    pub charged: Vec<ZakatCharge>,
    pub already_processed: usize,
    pub below_minimum: usize,
    pub failed: Vec<ZakatFailure>,
    pub total: Amount,
}

/// Pause before a scheduled run retries after finding another run active.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(30);
pub const MAX_SCHEDULED_ATTEMPTS: u32 = 10;

pub struct ZakatScheduler {
    engine: Arc<LedgerEngine>,
    run_lock: Mutex<()>,
    enabled: bool,
    retry_backoff: Duration,
}

impl ZakatScheduler {
    pub fn new(engine: Arc<LedgerEngine>, enabled: bool) -> Self {
        ZakatScheduler {
            engine,
            run_lock: Mutex::new(()),
            enabled,
            retry_backoff: RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Runs for the current calendar month.
    pub fn run(&self, trigger: &str) -> Result<ZakatRunReport, ChainError> {
        self.run_for_period(&period_key(Utc::now()), trigger)
    }

    /// Charges every eligible wallet for `period`. A concurrent run returns
    /// `ZakatRunInProgress`.
    pub fn run_for_period(&self, period: &str, trigger: &str) -> Result<ZakatRunReport, ChainError> {
        let _running = self.run_lock.try_lock().ok_or(ChainError::ZakatRunInProgress)?;
        let settings = self.engine.settings();
        let book = self.engine.zakat_book();

        let mut report = ZakatRunReport {
            period: period.to_string(),
            charged: Vec::new(),
            already_processed: 0,
            below_minimum: 0,
            failed: Vec::new(),
            total: Amount::ZERO,
        };

        for (wallet, balance) in self.engine.zakat_candidates() {
            if balance <= settings.zakat_minimum_balance {
                report.below_minimum += 1;
                continue;
            }
            let amount = zakat_due(balance, settings.zakat_rate_basis_points);
            if amount.is_zero() {
                report.below_minimum += 1;
                continue;
            }
            if !book.try_mark(&wallet, period)? {
                report.already_processed += 1;
                continue;
            }

            match self.engine.submit_zakat(&wallet, amount, period) {
                Ok(tx) => {
                    report.total = report.total.checked_add(amount).unwrap_or(report.total);
                    report.charged.push(ZakatCharge {
                        wallet_id: wallet,
                        balance,
                        amount,
                        tx_id: tx.tx_id,
                    });
                }
                Err(e) => {
                    warn!(wallet = %wallet, error = %e, "zakat deduction rejected");
                    book.release(&wallet, period);
                    report.failed.push(ZakatFailure {
                        wallet_id: wallet,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let status = if report.failed.is_empty() {
            LogStatus::Success
        } else {
            LogStatus::Error
        };
        self.engine.audit().record_system(SystemLog::new(
            "zakat_run",
            format!(
                "{} run for {}: {} charged, {} already processed, {} below minimum, {} failed, total {}",
                trigger,
                period,
                report.charged.len(),
                report.already_processed,
                report.below_minimum,
                report.failed.len(),
                report.total
            ),
            status,
        ));
        Ok(report)
    }

    /// Fires on the first of every month until `shutdown` is cancelled.
    pub async fn run_monthly(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.enabled {
            info!("zakat scheduler disabled");
            return;
        }

        loop {
            let now = Utc::now();
            let next = next_run_after(now);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next_run = %next, "zakat scheduler waiting");

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("zakat scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            self.run_scheduled(&period_key(next), &shutdown).await;
        }
    }

    /// One scheduled run. A manual run holding the lock delays it by
    /// `retry_backoff`, at most `MAX_SCHEDULED_ATTEMPTS` times.
    async fn run_scheduled(self: &Arc<Self>, period: &str, shutdown: &CancellationToken) -> Option<ZakatRunReport> {
        for attempt in 1..=MAX_SCHEDULED_ATTEMPTS {
            let scheduler = self.clone();
            let key = period.to_string();
            let result = tokio::task::spawn_blocking(move || scheduler.run_for_period(&key, "scheduled")).await;
            match result {
                Ok(Ok(report)) => {
                    info!(
                        period = %report.period,
                        charged = report.charged.len(),
                        total = %report.total,
                        "scheduled zakat run finished"
                    );
                    return Some(report);
                }
                Ok(Err(ChainError::ZakatRunInProgress)) => {
                    warn!(period, attempt, "zakat run already in progress, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "scheduled zakat run did not complete");
                    return None;
                }
                Err(e) => {
                    error!(error = %e, "scheduled zakat task panicked");
                    return None;
                }
            }
        }
        warn!(period, "scheduled zakat run skipped, another run kept the lock");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;

    #[test]
    fn test_period_key_and_next_run() {
        let at = Utc.with_ymd_and_hms(2024, 12, 15, 8, 30, 0).unwrap();
        assert_eq!(period_key(at), "2024-12");
        assert_eq!(next_run_after(at), Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());

        let first = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(next_run_after(first), Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_zakat_due_rounds_down() {
        assert_eq!(zakat_due(Amount::from_coins(100), 250), "2.5".parse().unwrap());
        assert_eq!(zakat_due(Amount::from_units(39), 250), Amount::ZERO);
        assert_eq!(zakat_due(Amount::from_units(41), 250), Amount::from_units(1));
    }

    fn scheduler(backoff: Duration) -> Arc<ZakatScheduler> {
        let engine = Arc::new(
            LedgerEngine::open(
                crate::engine::EngineSettings::default(),
                Arc::new(InMemoryPersistence::new()),
            )
            .unwrap(),
        );
        Arc::new(ZakatScheduler::new(engine, true).with_retry_backoff(backoff))
    }

    #[tokio::test]
    async fn test_scheduled_run_waits_for_manual_run() {
        let scheduler = scheduler(Duration::from_millis(20));
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || {
                let _running = scheduler.run_lock.lock();
                locked_tx.send(()).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(80));
            })
        };
        locked_rx.recv().unwrap();

        let report = scheduler
            .run_scheduled("2024-09", &CancellationToken::new())
            .await
            .expect("run should go ahead once the lock is free");
        assert_eq!(report.period, "2024-09");
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn test_scheduled_retry_stops_on_shutdown() {
        let scheduler = scheduler(Duration::from_secs(60));
        let _running = scheduler.run_lock.lock();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(scheduler.run_scheduled("2024-09", &shutdown).await.is_none());
    }

    #[test]
    fn test_marker_taken_once() {
        let book = ZakatBook::open(Arc::new(InMemoryPersistence::new())).unwrap();
        let wallet = WalletId::from("w");
        assert!(book.try_mark(&wallet, "2024-03").unwrap());
        assert!(!book.try_mark(&wallet, "2024-03").unwrap());
        assert!(book.try_mark(&wallet, "2024-04").unwrap());

        book.release(&wallet, "2024-03");
        assert!(!book.is_processed(&wallet, "2024-03"));
    }

    #[test]
    fn test_unconfirmed_markers_released_on_open() {
        let persistence: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let wallet = WalletId::from("w");
        persistence.save_zakat_period(&wallet, "2024-03").unwrap();

        let book = ZakatBook::open(persistence.clone()).unwrap();
        assert!(!book.is_processed(&wallet, "2024-03"));
        assert!(persistence.load_zakat_periods().unwrap().is_empty());
    }
}
