//! Durable position state and trade locks
//!
//! SQLite-backed key-value tables that survive process restarts. The
//! store is the bot's single source of truth for what it believes its
//! position is; the reconciler corrects it against exchange reality
//! every cycle.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use crate::types::Side;

/// Locally believed position state for one symbol
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionRecord {
    pub side: Side,
    pub stop_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed bot state
pub struct StateStore {
    db: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            db: Mutex::new(conn),
        };
        store.init_schema()?;
        info!(db_path = %path.display(), "state store opened");
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            db: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS position_state (
                symbol     TEXT PRIMARY KEY,
                side       TEXT NOT NULL,
                stop_price REAL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trade_lock (
                key        TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS last_entry (
                key   TEXT PRIMARY KEY,
                price REAL NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// The believed position for `symbol`; `None` when flat.
    pub fn position(&self, symbol: &str) -> Result<Option<PositionRecord>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT side, stop_price, updated_at FROM position_state WHERE symbol = ?1",
                params![symbol],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((side, stop_price, updated_at)) if side != "none" => {
                let side = side
                    .parse::<Side>()
                    .map_err(|e| anyhow::anyhow!("corrupt side in store: {e}"))?;
                let updated_at = updated_at
                    .parse::<DateTime<Utc>>()
                    .map_err(|e| anyhow::anyhow!("corrupt timestamp in store: {e}"))?;
                Ok(Some(PositionRecord {
                    side,
                    stop_price,
                    updated_at,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Record an open position and its protective stop price
    pub fn set_position(&self, symbol: &str, side: Side, stop_price: Option<f64>) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO position_state (symbol, side, stop_price, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol) DO UPDATE SET
                 side = excluded.side,
                 stop_price = excluded.stop_price,
                 updated_at = excluded.updated_at",
            params![
                symbol,
                side.to_string().to_lowercase(),
                stop_price,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Reset the believed position to flat
    pub fn clear_position(&self, symbol: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO position_state (symbol, side, stop_price, updated_at)
             VALUES (?1, 'none', NULL, ?2)
             ON CONFLICT(symbol) DO UPDATE SET
                 side = 'none',
                 stop_price = NULL,
                 updated_at = excluded.updated_at",
            params![symbol, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Whether the re-entry cooldown for `key` is still running
    pub fn is_trade_locked(&self, key: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let expires_at: Option<i64> = db
            .query_row(
                "SELECT expires_at FROM trade_lock WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(matches!(expires_at, Some(t) if Utc::now().timestamp() < t))
    }

    /// Start (or extend) the re-entry cooldown. Expiry is purely
    /// time-based; stale rows are simply ignored.
    pub fn set_trade_lock(&self, key: &str, minutes: i64) -> Result<()> {
        let expires_at = (Utc::now() + Duration::minutes(minutes)).timestamp();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO trade_lock (key, expires_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
            params![key, expires_at],
        )?;
        Ok(())
    }

    pub fn last_entry_price(&self, key: &str) -> Result<Option<f64>> {
        let db = self.db.lock().unwrap();
        Ok(db
            .query_row(
                "SELECT price FROM last_entry WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_last_entry_price(&self, key: &str, price: f64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO last_entry (key, price) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET price = excluded.price",
            params![key, price],
        )?;
        Ok(())
    }
}
