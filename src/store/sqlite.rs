//! SQLite-backed trade store
//!
//! WAL mode, one connection behind a mutex: the single write path that
//! serializes concurrent open/close attempts on the same scope. The
//! UNIQUE(mode, account) constraint on open_positions enforces
//! at-most-one open position per scope at the storage layer, not just in
//! application logic.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::{CloseOutcome, TradeStore};
use crate::error::StoreError;
use crate::ledger::orders::OrderLedgerEntry;
use crate::position::metrics::{self, ExitFill};
use crate::types::{
    BalanceRecord, ClosedTrade, MarketContext, OpenPosition, Scope, Side, Symbol, TradingMode,
};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!("SQLite store initialized at {}", db_path.display());
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        let conn = self.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS open_positions (
                mode TEXT NOT NULL,
                account TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity REAL NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                entry_time TEXT NOT NULL,
                stop_price REAL,
                target_price REAL,
                min_trade_price REAL NOT NULL,
                max_trade_price REAL NOT NULL,
                entry_context TEXT NOT NULL DEFAULT '{}',
                last_update_time TEXT NOT NULL,
                UNIQUE(mode, account)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS closed_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mode TEXT NOT NULL,
                account TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                realized_pnl REAL NOT NULL,
                commission REAL NOT NULL DEFAULT 0,
                mae REAL NOT NULL DEFAULT 0,
                mfe REAL NOT NULL DEFAULT 0,
                efficiency REAL NOT NULL DEFAULT 0,
                r_multiple REAL,
                entry_context TEXT NOT NULL DEFAULT '{}',
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS order_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                account TEXT NOT NULL,
                symbol TEXT,
                side TEXT,
                kind TEXT,
                status TEXT NOT NULL,
                reason TEXT,
                quantity REAL,
                filled_quantity REAL NOT NULL DEFAULT 0,
                avg_fill_price REAL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                info_text TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS balance_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mode TEXT NOT NULL,
                account TEXT NOT NULL,
                balance REAL NOT NULL,
                open_pnl REAL NOT NULL DEFAULT 0,
                daily_pnl REAL NOT NULL DEFAULT 0,
                as_of TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_closed_trades_scope
             ON closed_trades(mode, account)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_order_records_account
             ON order_records(account)",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another writer panicked mid-operation;
        // the data itself is transaction-protected
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TradeStore for SqliteStore {
    fn open_position(&self, position: &OpenPosition) -> Result<(), StoreError> {
        let conn = self.lock();
        let context_json = serde_json::to_string(&position.entry_context)?;

        let result = conn.execute(
            "INSERT INTO open_positions
             (mode, account, symbol, quantity, side, entry_price, entry_time,
              stop_price, target_price, min_trade_price, max_trade_price,
              entry_context, last_update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                position.scope.mode.as_str(),
                position.scope.account,
                position.symbol.as_str(),
                position.quantity,
                position.side.to_string(),
                position.entry_price,
                position.entry_time.to_rfc3339(),
                position.stop_price,
                position.target_price,
                position.min_trade_price,
                position.max_trade_price,
                context_json,
                position.last_update_time.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {
                debug!(
                    "Position opened: {} {} qty={} @ {}",
                    position.scope, position.symbol, position.quantity, position.entry_price
                );
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::PositionExists(position.scope.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_position(&self, position: &OpenPosition) -> Result<(), StoreError> {
        let conn = self.lock();
        let context_json = serde_json::to_string(&position.entry_context)?;

        conn.execute(
            "UPDATE open_positions SET
                symbol = ?3, quantity = ?4, side = ?5, entry_price = ?6,
                entry_time = ?7, stop_price = ?8, target_price = ?9,
                min_trade_price = ?10, max_trade_price = ?11,
                entry_context = ?12, last_update_time = ?13
             WHERE mode = ?1 AND account = ?2",
            params![
                position.scope.mode.as_str(),
                position.scope.account,
                position.symbol.as_str(),
                position.quantity,
                position.side.to_string(),
                position.entry_price,
                position.entry_time.to_rfc3339(),
                position.stop_price,
                position.target_price,
                position.min_trade_price,
                position.max_trade_price,
                context_json,
                position.last_update_time.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_position(&self, scope: &Scope) -> Result<Option<OpenPosition>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT mode, account, symbol, quantity, side, entry_price,
                    entry_time, stop_price, target_price, min_trade_price,
                    max_trade_price, entry_context, last_update_time
             FROM open_positions WHERE mode = ?1 AND account = ?2",
        )?;
        let position = stmt
            .query_row(params![scope.mode.as_str(), scope.account], position_from_row)
            .optional()?;
        Ok(position)
    }

    fn list_positions(&self) -> Result<Vec<OpenPosition>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT mode, account, symbol, quantity, side, entry_price,
                    entry_time, stop_price, target_price, min_trade_price,
                    max_trade_price, entry_context, last_update_time
             FROM open_positions ORDER BY mode, account",
        )?;
        let positions = stmt
            .query_map([], position_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    fn close_position(&self, scope: &Scope, exit: &ExitFill) -> Result<CloseOutcome, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let position = tx
            .prepare(
                "SELECT mode, account, symbol, quantity, side, entry_price,
                        entry_time, stop_price, target_price, min_trade_price,
                        max_trade_price, entry_context, last_update_time
                 FROM open_positions WHERE mode = ?1 AND account = ?2",
            )?
            .query_row(params![scope.mode.as_str(), scope.account], position_from_row)
            .optional()?;

        let Some(position) = position else {
            // Duplicate close from a second notification path
            debug!("Close for {} found no open position, no-op", scope);
            return Ok(CloseOutcome::AlreadyClosed);
        };

        let trade = metrics::build_closed_trade(&position, exit);
        let context_json = serde_json::to_string(&trade.entry_context)?;

        tx.execute(
            "INSERT INTO closed_trades
             (mode, account, symbol, side, quantity, entry_price, exit_price,
              entry_time, exit_time, realized_pnl, commission, mae, mfe,
              efficiency, r_multiple, entry_context)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                trade.scope.mode.as_str(),
                trade.scope.account,
                trade.symbol.as_str(),
                trade.side.to_string(),
                trade.quantity,
                trade.entry_price,
                trade.exit_price,
                trade.entry_time.to_rfc3339(),
                trade.exit_time.to_rfc3339(),
                trade.realized_pnl,
                trade.commission,
                trade.mae,
                trade.mfe,
                trade.efficiency,
                trade.r_multiple,
                context_json,
            ],
        )?;
        tx.execute(
            "DELETE FROM open_positions WHERE mode = ?1 AND account = ?2",
            params![scope.mode.as_str(), scope.account],
        )?;
        tx.commit()?;

        info!(
            "Trade closed: {} {} {} qty={} {} -> {} | PnL={:+.2}",
            trade.scope,
            trade.side,
            trade.symbol,
            trade.quantity,
            trade.entry_price,
            trade.exit_price,
            trade.realized_pnl
        );
        Ok(CloseOutcome::Closed(trade))
    }

    fn list_trades(&self, scope: Option<&Scope>) -> Result<Vec<ClosedTrade>, StoreError> {
        let conn = self.lock();
        let base = "SELECT mode, account, symbol, side, quantity, entry_price,
                           exit_price, entry_time, exit_time, realized_pnl,
                           commission, mae, mfe, efficiency, r_multiple,
                           entry_context
                    FROM closed_trades";

        match scope {
            Some(s) => {
                let mut stmt =
                    conn.prepare(&format!("{} WHERE mode = ?1 AND account = ?2 ORDER BY id", base))?;
                let trades = stmt
                    .query_map(params![s.mode.as_str(), s.account], trade_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(trades)
            }
            None => {
                let mut stmt = conn.prepare(&format!("{} ORDER BY id", base))?;
                let trades = stmt
                    .query_map([], trade_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(trades)
            }
        }
    }

    fn realized_pnl_sum(&self, scope: &Scope) -> Result<f64, StoreError> {
        let conn = self.lock();
        let sum: f64 = conn.query_row(
            "SELECT COALESCE(SUM(realized_pnl), 0) FROM closed_trades
             WHERE mode = ?1 AND account = ?2",
            params![scope.mode.as_str(), scope.account],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    fn record_order(&self, entry: &OrderLedgerEntry) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO order_records
             (order_id, account, symbol, side, kind, status, reason, quantity,
              filled_quantity, avg_fill_price, first_seen, last_seen, info_text)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.order_id,
                entry.account,
                entry.symbol.as_ref().map(|s| s.as_str().to_string()),
                entry.side.map(|s| s.to_string()),
                entry.kind.map(|k| format!("{:?}", k)),
                format!("{:?}", entry.status),
                entry.reason,
                entry.quantity,
                entry.filled_quantity,
                entry.avg_fill_price,
                entry.first_seen.to_rfc3339(),
                entry.last_seen.to_rfc3339(),
                entry.text,
            ],
        )?;
        Ok(())
    }

    fn append_balance_snapshot(
        &self,
        scope: &Scope,
        record: &BalanceRecord,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO balance_snapshots
             (mode, account, balance, open_pnl, daily_pnl, as_of)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                scope.mode.as_str(),
                scope.account,
                record.balance,
                record.open_pnl,
                record.daily_pnl,
                record.as_of.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn last_recorded_fill_ts(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.lock();
        let ts: Option<String> = conn.query_row(
            "SELECT MAX(last_seen) FROM order_records WHERE filled_quantity > 0",
            [],
            |row| row.get(0),
        )?;
        Ok(ts.and_then(|s| parse_ts(&s)))
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_side(s: &str) -> Side {
    if s == "SELL" {
        Side::Sell
    } else {
        Side::Buy
    }
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<OpenPosition> {
    let mode: String = row.get(0)?;
    let entry_time: String = row.get(6)?;
    let last_update: String = row.get(12)?;
    let side: String = row.get(4)?;
    let context: String = row.get(11)?;

    Ok(OpenPosition {
        scope: Scope::new(TradingMode::parse(&mode), row.get::<_, String>(1)?),
        symbol: Symbol::new(row.get::<_, String>(2)?),
        quantity: row.get(3)?,
        side: parse_side(&side),
        entry_price: row.get(5)?,
        entry_time: parse_ts(&entry_time).unwrap_or_else(Utc::now),
        stop_price: row.get(7)?,
        target_price: row.get(8)?,
        min_trade_price: row.get(9)?,
        max_trade_price: row.get(10)?,
        entry_context: serde_json::from_str::<MarketContext>(&context).unwrap_or_default(),
        last_update_time: parse_ts(&last_update).unwrap_or_else(Utc::now),
    })
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<ClosedTrade> {
    let mode: String = row.get(0)?;
    let side: String = row.get(3)?;
    let entry_time: String = row.get(7)?;
    let exit_time: String = row.get(8)?;
    let context: String = row.get(15)?;

    Ok(ClosedTrade {
        scope: Scope::new(TradingMode::parse(&mode), row.get::<_, String>(1)?),
        symbol: Symbol::new(row.get::<_, String>(2)?),
        side: parse_side(&side),
        quantity: row.get(4)?,
        entry_price: row.get(5)?,
        exit_price: row.get(6)?,
        entry_time: parse_ts(&entry_time).unwrap_or_else(Utc::now),
        exit_time: parse_ts(&exit_time).unwrap_or_else(Utc::now),
        realized_pnl: row.get(9)?,
        commission: row.get(10)?,
        mae: row.get(11)?,
        mfe: row.get(12)?,
        efficiency: row.get(13)?,
        r_multiple: row.get(14)?,
        entry_context: serde_json::from_str::<MarketContext>(&context).unwrap_or_default(),
    })
}
