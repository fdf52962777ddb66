//! Embedded trade database (SQLite via sqlx). Ids are monotonic per
//! database; migration is idempotent and runs on first connection.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub id: i64,
    pub scenario: String,
    pub symbol: String,
    pub side: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub pnl_ratio: Decimal,
    pub was_stop_loss: bool,
    pub was_take_profit: bool,
    pub opened_at: i64,
    pub closed_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenTrade {
    pub id: i64,
    pub scenario: String,
    pub symbol: String,
    pub side: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub opened_at: i64,
}

pub struct TradeDb {
    pool: SqlitePool,
}

impl TradeDb {
    pub async fn connect(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context("failed to create trade db directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to trade database")?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Idempotent: safe to call on every connection, including ones where
    /// the schema already exists.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scenario TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                take_profit TEXT NOT NULL,
                opened_at INTEGER NOT NULL,
                exit_price TEXT,
                pnl TEXT,
                pnl_ratio TEXT,
                was_stop_loss INTEGER,
                was_take_profit INTEGER,
                closed_at INTEGER
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create trades table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_scenario ON trades (scenario, closed_at);",
        )
        .execute(&self.pool)
        .await
        .context("failed to create trades index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scenario TEXT NOT NULL,
                equity TEXT NOT NULL,
                cash TEXT NOT NULL,
                position_count INTEGER NOT NULL,
                at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create equity_snapshots table")?;

        info!("trade database schema ready");
        Ok(())
    }

    pub async fn insert_trade(
        &self,
        scenario: &str,
        symbol: &str,
        side: &str,
        quantity: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        opened_at: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (scenario, symbol, side, quantity, entry_price, stop_loss, take_profit, opened_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(scenario)
        .bind(symbol)
        .bind(side)
        .bind(quantity.to_string())
        .bind(entry_price.to_string())
        .bind(stop_loss.to_string())
        .bind(take_profit.to_string())
        .bind(opened_at)
        .execute(&self.pool)
        .await
        .context("failed to insert trade")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn close_trade(
        &self,
        id: i64,
        exit_price: Decimal,
        pnl: Decimal,
        pnl_ratio: Decimal,
        was_stop_loss: bool,
        was_take_profit: bool,
        closed_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades
            SET exit_price = ?, pnl = ?, pnl_ratio = ?, was_stop_loss = ?, was_take_profit = ?, closed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(exit_price.to_string())
        .bind(pnl.to_string())
        .bind(pnl_ratio.to_string())
        .bind(was_stop_loss)
        .bind(was_take_profit)
        .bind(closed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to close trade")?;
        Ok(())
    }

    pub async fn get_recent_closed_trades(&self, scenario: &str, since_ms: i64) -> Result<Vec<ClosedTrade>> {
        let rows = sqlx::query(
            r#"
            SELECT id, scenario, symbol, side, quantity, entry_price, exit_price, pnl, pnl_ratio,
                   was_stop_loss, was_take_profit, opened_at, closed_at
            FROM trades
            WHERE scenario = ? AND closed_at IS NOT NULL AND closed_at >= ?
            ORDER BY closed_at DESC
            "#,
        )
        .bind(scenario)
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await
        .context("failed to query recent closed trades")?;

        rows.into_iter().map(Self::row_to_closed_trade).collect()
    }

    pub async fn get_open_trades(&self, scenario: &str) -> Result<Vec<OpenTrade>> {
        let rows = sqlx::query(
            r#"
            SELECT id, scenario, symbol, side, quantity, entry_price, stop_loss, take_profit, opened_at
            FROM trades
            WHERE scenario = ? AND closed_at IS NULL
            ORDER BY opened_at ASC
            "#,
        )
        .bind(scenario)
        .fetch_all(&self.pool)
        .await
        .context("failed to query open trades")?;

        rows.into_iter()
            .map(|row| {
                Ok(OpenTrade {
                    id: row.try_get("id")?,
                    scenario: row.try_get("scenario")?,
                    symbol: row.try_get("symbol")?,
                    side: row.try_get("side")?,
                    quantity: Self::decimal_col(&row, "quantity")?,
                    entry_price: Self::decimal_col(&row, "entry_price")?,
                    stop_loss: Self::decimal_col(&row, "stop_loss")?,
                    take_profit: Self::decimal_col(&row, "take_profit")?,
                    opened_at: row.try_get("opened_at")?,
                })
            })
            .collect()
    }

    pub async fn record_snapshot(
        &self,
        scenario: &str,
        equity: Decimal,
        cash: Decimal,
        position_count: usize,
        at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO equity_snapshots (scenario, equity, cash, position_count, at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(scenario)
        .bind(equity.to_string())
        .bind(cash.to_string())
        .bind(position_count as i64)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("failed to record equity snapshot")?;
        Ok(())
    }

    fn decimal_col(row: &sqlx::sqlite::SqliteRow, name: &str) -> Result<Decimal> {
        let raw: String = row.try_get(name)?;
        Decimal::from_str(&raw).with_context(|| format!("invalid decimal in column {name}"))
    }

    fn row_to_closed_trade(row: sqlx::sqlite::SqliteRow) -> Result<ClosedTrade> {
        Ok(ClosedTrade {
            id: row.try_get("id")?,
            scenario: row.try_get("scenario")?,
            symbol: row.try_get("symbol")?,
            side: row.try_get("side")?,
            quantity: Self::decimal_col(&row, "quantity")?,
            entry_price: Self::decimal_col(&row, "entry_price")?,
            exit_price: Self::decimal_col(&row, "exit_price")?,
            pnl: Self::decimal_col(&row, "pnl")?,
            pnl_ratio: Self::decimal_col(&row, "pnl_ratio")?,
            was_stop_loss: row.try_get::<i64, _>("was_stop_loss")? != 0,
            was_take_profit: row.try_get::<i64, _>("was_take_profit")? != 0,
            opened_at: row.try_get("opened_at")?,
            closed_at: row.try_get("closed_at")?,
        })
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn in_memory_db() -> TradeDb {
        TradeDb::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn insert_and_close_roundtrip() {
        let db = in_memory_db().await;
        let id = db
            .insert_trade("s1", "BTCUSDT", "long", dec!(1), dec!(100), dec!(90), dec!(120), 1000)
            .await
            .unwrap();
        assert_eq!(id, 1);

        let open = db.get_open_trades("s1").await.unwrap();
        assert_eq!(open.len(), 1);

        db.close_trade(id, dec!(110), dec!(10), dec!(0.1), false, false, 2000)
            .await
            .unwrap();

        let closed = db.get_recent_closed_trades("s1", 0).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].pnl, dec!(10));

        let open_after = db.get_open_trades("s1").await.unwrap();
        assert!(open_after.is_empty());
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let db = in_memory_db().await;
        let first = db
            .insert_trade("s1", "BTCUSDT", "long", dec!(1), dec!(100), dec!(90), dec!(120), 1000)
            .await
            .unwrap();
        let second = db
            .insert_trade("s1", "ETHUSDT", "long", dec!(1), dec!(50), dec!(45), dec!(60), 1001)
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = in_memory_db().await;
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn record_snapshot_does_not_error() {
        let db = in_memory_db().await;
        db.record_snapshot("s1", dec!(10500), dec!(9000), 2, 5000).await.unwrap();
    }
}
