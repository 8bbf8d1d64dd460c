//! SQLite persistence
//!
//! Holds what must survive a restart:
//! - key/value settings that override the configuration file
//! - the append-only trade ledger
//! - held-since timestamps feeding the time-based exit
//! - trailing-stop high-water marks

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::common::errors::{Result, TraderError};
use crate::common::types::Side;
use crate::config::types::DatabaseConfig;

/// One ledger line
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub reason: String,
    /// Unrealized return at the time of a sell, in percent
    pub return_pct: Option<Decimal>,
    /// Profit booked by a sell
    pub realized_pnl: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn buy(symbol: &str, quantity: u64, price: Decimal, reason: &str, at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Side::Buy,
            quantity,
            price,
            reason: reason.to_string(),
            return_pct: None,
            realized_pnl: None,
            created_at: at,
        }
    }

    pub fn sell(
        symbol: &str,
        quantity: u64,
        price: Decimal,
        avg_cost: Decimal,
        return_pct: Decimal,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Side::Sell,
            quantity,
            price,
            reason: reason.to_string(),
            return_pct: Some(return_pct),
            realized_pnl: Some((price - avg_cost) * Decimal::from(quantity)),
            created_at: at,
        }
    }
}

/// Database handle
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database described by `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!(url = %config.url, "Database ready");
        Ok(store)
    }

    /// Private in-memory database, used when none is configured and in tests.
    pub async fn in_memory() -> Result<Self> {
        // Each in-memory connection is its own database, so keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price TEXT NOT NULL,
                reason TEXT NOT NULL,
                return_pct TEXT,
                realized_pnl TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_created_at ON trades(created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS held_since (
                symbol TEXT PRIMARY KEY,
                since TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS high_prices (
                symbol TEXT PRIMARY KEY,
                price TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("Migrations applied");
        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub async fn get_settings(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, String)> {
                Ok((row.try_get("key")?, row.try_get("value")?))
            })
            .collect()
    }

    pub async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Trade ledger
    // ========================================================================

    pub async fn append_trade(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (symbol, side, quantity, price, reason, return_pct, realized_pnl, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.symbol)
        .bind(record.side.to_string())
        .bind(i64::try_from(record.quantity).unwrap_or(i64::MAX))
        .bind(record.price.to_string())
        .bind(&record.reason)
        .bind(record.return_pct.map(|d| d.to_string()))
        .bind(record.realized_pnl.map(|d| d.to_string()))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Ledger lines at or after `since`, oldest first.
    pub async fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, side, quantity, price, reason, return_pct, realized_pnl, created_at
            FROM trades WHERE created_at >= ? ORDER BY id ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trade_from_row).collect()
    }

    /// Sum of profit booked by sells at or after `since`.
    pub async fn realized_profit_since(&self, since: DateTime<Utc>) -> Result<Decimal> {
        let trades = self.trades_since(since).await?;
        Ok(trades.iter().filter_map(|t| t.realized_pnl).sum())
    }

    // ========================================================================
    // Held-since
    // ========================================================================

    pub async fn load_held_since(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let rows = sqlx::query("SELECT symbol, since FROM held_since")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, DateTime<Utc>)> {
                Ok((row.try_get("symbol")?, row.try_get("since")?))
            })
            .collect()
    }

    /// Record the first time a symbol was seen held; existing rows are kept.
    pub async fn save_held_since(&self, symbol: &str, since: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO held_since (symbol, since) VALUES (?, ?)")
            .bind(symbol)
            .bind(since)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_held_since(&self, symbol: &str) -> Result<()> {
        sqlx::query("DELETE FROM held_since WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // High-water marks
    // ========================================================================

    pub async fn load_high_prices(&self) -> Result<HashMap<String, Decimal>> {
        let rows = sqlx::query("SELECT symbol, price FROM high_prices")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, Decimal)> {
                let price: String = row.try_get("price")?;
                Ok((row.try_get("symbol")?, parse_decimal(&price)?))
            })
            .collect()
    }

    pub async fn save_high_price(&self, symbol: &str, price: Decimal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO high_prices (symbol, price, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(symbol) DO UPDATE SET price = excluded.price, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(symbol)
        .bind(price.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_high_price(&self, symbol: &str) -> Result<()> {
        sqlx::query("DELETE FROM high_prices WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| TraderError::Internal(format!("corrupt decimal '{}': {}", value, e)))
}

fn trade_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TradeRecord> {
    let side: String = row.try_get("side")?;
    let side = match side.as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        other => return Err(TraderError::Internal(format!("corrupt side '{}'", other))),
    };
    let quantity: i64 = row.try_get("quantity")?;
    let price: String = row.try_get("price")?;
    let return_pct: Option<String> = row.try_get("return_pct")?;
    let realized_pnl: Option<String> = row.try_get("realized_pnl")?;

    Ok(TradeRecord {
        symbol: row.try_get("symbol")?,
        side,
        quantity: u64::try_from(quantity).unwrap_or_default(),
        price: parse_decimal(&price)?,
        reason: row.try_get("reason")?,
        return_pct: return_pct.as_deref().map(parse_decimal).transpose()?,
        realized_pnl: realized_pnl.as_deref().map(parse_decimal).transpose()?,
        created_at: row.try_get("created_at")?,
    })
}
