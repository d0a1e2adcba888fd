//! Per-account page quota ledger.
//!
//! One counter row per account and calendar month (`YYYY-MM`, UTC). The quota of
//! a new counter is the account's override, or the configured default.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};

use crate::db::Db;
use crate::error::Result;
use crate::models::UsageCounter;

/// Outcome of an admission query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: i64,
    pub limit: i64,
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Whether `pages` more pages fit under the quota. Does not change the counter.
    async fn check(&self, account_id: &str, pages: i64) -> Result<Admission>;

    /// Record processed pages unconditionally
    async fn increment(&self, account_id: &str, pages: i64) -> Result<()>;

    /// Atomically add `pages` only if the result stays within the quota
    async fn try_reserve(&self, account_id: &str, pages: i64) -> Result<Admission>;

    /// Undo a reservation; never drops the counter below zero
    async fn release(&self, account_id: &str, pages: i64) -> Result<()>;

    /// Current period's counter
    async fn counter(&self, account_id: &str) -> Result<UsageCounter>;
}

pub fn current_period() -> String {
    Utc::now().format("%Y-%m").to_string()
}

/// SQLite-backed ledger over the `usage_counters` table
#[derive(Debug, Clone)]
pub struct SqliteUsageLedger {
    db: Db,
    default_quota: i64,
}

impl SqliteUsageLedger {
    pub fn new(db: Db, default_quota: i64) -> Self {
        Self { db, default_quota }
    }

    /// Override an account's quota, including the current period's counter
    pub async fn set_quota(&self, account_id: &str, quota: i64) -> Result<UsageCounter> {
        if quota < 0 {
            return Err(crate::error::GenieError::InvalidInput(
                "Quota must not be negative".to_string(),
            ));
        }
        let account_id = account_id.to_string();
        let default_quota = self.default_quota;
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE accounts SET page_quota = ?1 WHERE id = ?2",
                    params![quota, account_id],
                )?;
                let period = current_period();
                ensure_counter(&tx, &account_id, &period, default_quota)?;
                tx.execute(
                    "UPDATE usage_counters SET page_quota = ?1, updated_at = ?2
                     WHERE account_id = ?3 AND period = ?4",
                    params![quota, Utc::now().to_rfc3339(), account_id, period],
                )?;
                let counter = read_counter(&tx, &account_id, &period)?;
                tx.commit()?;
                Ok(counter)
            })
            .await
    }
}

fn ensure_counter(conn: &Connection, account_id: &str, period: &str, default_quota: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT OR IGNORE INTO usage_counters (account_id, period, pages_processed, page_quota, updated_at)
        VALUES (?1, ?2, 0, COALESCE((SELECT page_quota FROM accounts WHERE id = ?1), ?3), ?4)
        "#,
        params![account_id, period, default_quota, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn read_counter(conn: &Connection, account_id: &str, period: &str) -> Result<UsageCounter> {
    let counter = conn.query_row(
        "SELECT account_id, period, pages_processed, page_quota FROM usage_counters
         WHERE account_id = ?1 AND period = ?2",
        params![account_id, period],
        |row| {
            Ok(UsageCounter {
                account_id: row.get(0)?,
                period: row.get(1)?,
                pages_processed: row.get(2)?,
                page_quota: row.get(3)?,
            })
        },
    )?;
    Ok(counter)
}

fn admission(counter: &UsageCounter, allowed: bool) -> Admission {
    Admission {
        allowed,
        remaining: counter.remaining(),
        limit: counter.page_quota,
    }
}

#[async_trait]
impl UsageLedger for SqliteUsageLedger {
    async fn check(&self, account_id: &str, pages: i64) -> Result<Admission> {
        let account_id = account_id.to_string();
        let default_quota = self.default_quota;
        self.db
            .with_connection(move |conn| {
                let period = current_period();
                ensure_counter(conn, &account_id, &period, default_quota)?;
                let counter = read_counter(conn, &account_id, &period)?;
                let allowed = counter.pages_processed + pages <= counter.page_quota;
                Ok(admission(&counter, allowed))
            })
            .await
    }

    async fn increment(&self, account_id: &str, pages: i64) -> Result<()> {
        let account_id = account_id.to_string();
        let default_quota = self.default_quota;
        self.db
            .with_connection(move |conn| {
                let period = current_period();
                ensure_counter(conn, &account_id, &period, default_quota)?;
                conn.execute(
                    "UPDATE usage_counters SET pages_processed = pages_processed + ?1, updated_at = ?2
                     WHERE account_id = ?3 AND period = ?4",
                    params![pages, Utc::now().to_rfc3339(), account_id, period],
                )?;
                Ok(())
            })
            .await
    }

    async fn try_reserve(&self, account_id: &str, pages: i64) -> Result<Admission> {
        let account_id = account_id.to_string();
        let default_quota = self.default_quota;
        self.db
            .with_connection(move |conn| {
                let period = current_period();
                ensure_counter(conn, &account_id, &period, default_quota)?;
                // Single conditional UPDATE: concurrent reservations serialize on the write lock
                let reserved = conn.execute(
                    "UPDATE usage_counters SET pages_processed = pages_processed + ?1, updated_at = ?2
                     WHERE account_id = ?3 AND period = ?4 AND pages_processed + ?1 <= page_quota",
                    params![pages, Utc::now().to_rfc3339(), account_id, period],
                )?;
                let counter = read_counter(conn, &account_id, &period)?;
                Ok(admission(&counter, reserved == 1))
            })
            .await
    }

    async fn release(&self, account_id: &str, pages: i64) -> Result<()> {
        let account_id = account_id.to_string();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE usage_counters SET pages_processed = MAX(pages_processed - ?1, 0), updated_at = ?2
                     WHERE account_id = ?3 AND period = ?4",
                    params![pages, Utc::now().to_rfc3339(), account_id, current_period()],
                )?;
                Ok(())
            })
            .await
    }

    async fn counter(&self, account_id: &str) -> Result<UsageCounter> {
        let account_id = account_id.to_string();
        let default_quota = self.default_quota;
        self.db
            .with_connection(move |conn| {
                let period = current_period();
                ensure_counter(conn, &account_id, &period, default_quota)?;
                read_counter(conn, &account_id, &period)
            })
            .await
    }
}
