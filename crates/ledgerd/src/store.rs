//! SQLite-backed persistence gateway
//!
//! Single connection behind a mutex; every delta runs in its own SQL
//! transaction together with its transaction_log row.

use crate::gateway::{GatewayError, PersistenceGateway};
use anyhow::{Context, Result};
use chrono::Utc;
use ledger_common::{CurrencyType, SubjectId};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

pub struct SqliteGateway {
    conn: Mutex<Connection>,
}

impl SqliteGateway {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        info!("Opening ledger database at: {}", path.display());
        let conn = Connection::open(path).context("Failed to open SQLite database")?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("Failed to set synchronous mode")?;

        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        initialize_schema(&conn).context("Failed to initialize ledger schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement rolls back the open SQL transaction on drop
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn balance(&self, subject: &SubjectId, currency: CurrencyType) -> Result<i64, GatewayError> {
        let conn = self.lock();
        let balance = conn
            .query_row(
                "SELECT balance FROM currency_balances WHERE subject = ?1 AND currency = ?2",
                params![subject.to_string(), currency.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0))
    }

    pub fn balances(&self, subject: &SubjectId) -> Result<Vec<(CurrencyType, i64)>, GatewayError> {
        CurrencyType::ALL
            .iter()
            .map(|currency| self.balance(subject, *currency).map(|balance| (*currency, balance)))
            .collect()
    }

    pub fn honor(&self, subject: &SubjectId) -> Result<u64, GatewayError> {
        let conn = self.lock();
        let honor: Option<i64> = conn
            .query_row(
                "SELECT honor FROM honor WHERE subject = ?1",
                params![subject.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(honor.unwrap_or(0).max(0) as u64)
    }

    /// Number of applied deltas recorded for a subject
    pub fn log_count(&self, subject: &SubjectId) -> Result<u64, GatewayError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transaction_log WHERE subject = ?1",
            params![subject.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS currency_balances (
            subject TEXT NOT NULL,
            currency TEXT NOT NULL,
            balance INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (subject, currency)
        );
        CREATE TABLE IF NOT EXISTS honor (
            subject TEXT PRIMARY KEY,
            honor INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS transaction_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject TEXT NOT NULL,
            kind TEXT NOT NULL,
            amount INTEGER NOT NULL,
            source TEXT NOT NULL,
            recorded_at DATETIME NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_log_subject ON transaction_log(subject);",
    )
}

fn append_log(
    tx: &rusqlite::Transaction<'_>,
    subject: &SubjectId,
    kind: &str,
    amount: i64,
    source: &str,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO transaction_log (subject, kind, amount, source, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![subject.to_string(), kind, amount, source, Utc::now()],
    )?;
    Ok(())
}

impl PersistenceGateway for SqliteGateway {
    fn apply_currency_delta(
        &self,
        subject: &SubjectId,
        amount: i64,
        source: &str,
        currency: CurrencyType,
    ) -> Result<(), GatewayError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let balance: i64 = tx
            .query_row(
                "SELECT balance FROM currency_balances WHERE subject = ?1 AND currency = ?2",
                params![subject.to_string(), currency.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let updated = balance
            .checked_add(amount)
            .ok_or_else(|| GatewayError::Rejected(format!("{} balance overflow for {}", currency, subject)))?;
        if updated < 0 {
            return Err(GatewayError::InsufficientBalance {
                subject: *subject,
                currency,
                balance,
                delta: amount,
            });
        }

        tx.execute(
            "INSERT INTO currency_balances (subject, currency, balance) VALUES (?1, ?2, ?3)
             ON CONFLICT(subject, currency) DO UPDATE SET balance = excluded.balance",
            params![subject.to_string(), currency.as_str(), updated],
        )?;
        append_log(&tx, subject, currency.as_str(), amount, source)?;
        tx.commit()?;

        debug!("{} {}: {} -> {} ({})", subject, currency, balance, updated, source);
        Ok(())
    }

    fn apply_honor_delta(&self, subject: &SubjectId, amount: i64, source: &str) -> Result<(), GatewayError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let honor: i64 = tx
            .query_row(
                "SELECT honor FROM honor WHERE subject = ?1",
                params![subject.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        // Cumulative honor never goes below zero
        let updated = honor.saturating_add(amount).max(0);

        tx.execute(
            "INSERT INTO honor (subject, honor) VALUES (?1, ?2)
             ON CONFLICT(subject) DO UPDATE SET honor = excluded.honor",
            params![subject.to_string(), updated],
        )?;
        append_log(&tx, subject, "honor", amount, source)?;
        tx.commit()?;

        debug!("{} honor: {} -> {} ({})", subject, honor, updated, source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_currency_delta_accumulates() {
        let store = SqliteGateway::open_in_memory().unwrap();
        let subject = SubjectId::random();

        store.apply_currency_delta(&subject, 100, "daily", CurrencyType::Coins).unwrap();
        store.apply_currency_delta(&subject, -30, "shop", CurrencyType::Coins).unwrap();
        store.apply_currency_delta(&subject, 5, "vote", CurrencyType::Tokens).unwrap();

        assert_eq!(store.balance(&subject, CurrencyType::Coins).unwrap(), 70);
        assert_eq!(store.balance(&subject, CurrencyType::Tokens).unwrap(), 5);
        assert_eq!(store.balance(&subject, CurrencyType::Credits).unwrap(), 0);
        assert_eq!(store.log_count(&subject).unwrap(), 3);
    }

    #[test]
    fn test_overdraw_is_rejected_and_changes_nothing() {
        let store = SqliteGateway::open_in_memory().unwrap();
        let subject = SubjectId::random();
        store.apply_currency_delta(&subject, 10, "daily", CurrencyType::Coins).unwrap();

        let err = store
            .apply_currency_delta(&subject, -25, "shop", CurrencyType::Coins)
            .unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientBalance { balance: 10, delta: -25, .. }));
        assert_eq!(store.balance(&subject, CurrencyType::Coins).unwrap(), 10);
        assert_eq!(store.log_count(&subject).unwrap(), 1);
    }

    #[test]
    fn test_honor_clamps_at_zero() {
        let store = SqliteGateway::open_in_memory().unwrap();
        let subject = SubjectId::random();

        store.apply_honor_delta(&subject, 40, "kill").unwrap();
        store.apply_honor_delta(&subject, -100, "death").unwrap();
        assert_eq!(store.honor(&subject).unwrap(), 0);

        store.apply_honor_delta(&subject, 15, "kill").unwrap();
        assert_eq!(store.honor(&subject).unwrap(), 15);
    }

    #[test]
    fn test_balances_lists_every_currency() {
        let store = SqliteGateway::open_in_memory().unwrap();
        let subject = SubjectId::random();
        store.apply_currency_delta(&subject, 3, "x", CurrencyType::Credits).unwrap();

        let balances = store.balances(&subject).unwrap();
        assert_eq!(
            balances,
            vec![
                (CurrencyType::Coins, 0),
                (CurrencyType::Tokens, 0),
                (CurrencyType::Credits, 3)
            ]
        );
    }

    #[test]
    fn test_file_database_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("ledger.db");
        let subject = SubjectId::random();

        {
            let store = SqliteGateway::open(&path).unwrap();
            store.apply_honor_delta(&subject, 250, "quest").unwrap();
        }

        let store = SqliteGateway::open(&path).unwrap();
        assert_eq!(store.honor(&subject).unwrap(), 250);
    }
}
