//! SQLite persistence store.

use crate::domain::error::PerpError;
use crate::domain::metrics::RunResult;
use crate::domain::order::Order;
use crate::domain::position::ClosedPosition;
use crate::ports::config_port::ConfigPort;
use crate::ports::store_port::PersistenceStore;
use chrono::NaiveDateTime;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

/// One row of the `run_results` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub session: String,
    pub symbol: String,
    pub strategy: String,
    pub positions: i64,
    pub total_pnl_usd: f64,
    pub liquidations: i64,
}

fn format_time(time: NaiveDateTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

fn query_err(e: rusqlite::Error) -> PerpError {
    PerpError::DatabaseQuery {
        reason: e.to_string(),
    }
}

impl SqliteStore {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, PerpError> {
        let db_path =
            config
                .get_string("sqlite", "path")
                .ok_or_else(|| PerpError::ConfigMissing {
                    section: "sqlite".into(),
                    key: "path".into(),
                })?;

        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;
        Self::open(Path::new(&db_path), pool_size)
    }

    /// Opens (or creates) the database file at `path`.
    pub fn open(path: &Path, pool_size: u32) -> Result<Self, PerpError> {
        let manager = SqliteConnectionManager::file(path);
        let pool =
            Pool::builder()
                .max_size(pool_size.max(1))
                .build(manager)
                .map_err(|e: r2d2::Error| PerpError::Database {
                    reason: e.to_string(),
                })?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, PerpError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e: r2d2::Error| PerpError::Database {
                reason: e.to_string(),
            })?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, PerpError> {
        self.pool.get().map_err(|e: r2d2::Error| PerpError::Database {
            reason: e.to_string(),
        })
    }

    pub fn initialize_schema(&self) -> Result<(), PerpError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session TEXT NOT NULL,
                client_order_id TEXT NOT NULL,
                side TEXT NOT NULL,
                direction TEXT NOT NULL,
                size REAL NOT NULL,
                avg_price REAL NOT NULL,
                fee REAL NOT NULL,
                margin REAL NOT NULL,
                leverage REAL NOT NULL,
                position_avg_entry_price REAL NOT NULL,
                brutto_pnl_usd REAL,
                time TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_session ON orders(session);
            CREATE TABLE IF NOT EXISTS closed_positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session TEXT NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                avg_entry_price REAL NOT NULL,
                leverage REAL NOT NULL,
                cumulative_fee REAL NOT NULL,
                amount_usd REAL NOT NULL,
                highest_price REAL NOT NULL,
                lowest_price REAL NOT NULL,
                realized_pnl_usd REAL NOT NULL,
                realized_pnl_percent REAL NOT NULL,
                is_liquidated INTEGER NOT NULL,
                order_count INTEGER NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_closed_session ON closed_positions(session);
            CREATE TABLE IF NOT EXISTS run_results (
                session TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                strategy TEXT NOT NULL,
                start_capital REAL NOT NULL,
                positions INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                losses INTEGER NOT NULL,
                win_ratio REAL NOT NULL,
                total_pnl_usd REAL NOT NULL,
                total_pnl_percent REAL NOT NULL,
                total_fees_usd REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                liquidations INTEGER NOT NULL,
                sharpe_ratio REAL NOT NULL,
                sortino_ratio REAL NOT NULL,
                calmar_ratio REAL NOT NULL,
                avg_hold_minutes REAL NOT NULL,
                hodl_percent REAL NOT NULL
            );",
        )
        .map_err(query_err)?;
        Ok(())
    }

    pub fn count_orders(&self, session: &str) -> Result<usize, PerpError> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM orders WHERE session = ?1",
                params![session],
                |row| row.get(0),
            )
            .map_err(query_err)?;
        Ok(count as usize)
    }

    pub fn count_closed_positions(&self, session: &str) -> Result<usize, PerpError> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM closed_positions WHERE session = ?1",
                params![session],
                |row| row.get(0),
            )
            .map_err(query_err)?;
        Ok(count as usize)
    }

    pub fn load_results(&self) -> Result<Vec<StoredResult>, PerpError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT session, symbol, strategy, positions, total_pnl_usd, liquidations
                 FROM run_results ORDER BY session",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredResult {
                    session: row.get(0)?,
                    symbol: row.get(1)?,
                    strategy: row.get(2)?,
                    positions: row.get(3)?,
                    total_pnl_usd: row.get(4)?,
                    liquidations: row.get(5)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }
}

impl PersistenceStore for SqliteStore {
    fn write_order(&self, session: &str, order: &Order) -> Result<(), PerpError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO orders (session, client_order_id, side, direction, size, avg_price,
                fee, margin, leverage, position_avg_entry_price, brutto_pnl_usd, time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                session,
                order.client_order_id,
                order.side.as_str(),
                order.direction.as_str(),
                order.size,
                order.avg_price,
                order.fee,
                order.margin,
                order.leverage,
                order.position_avg_entry_price,
                order.brutto_pnl_usd,
                format_time(order.timestamp),
            ],
        )
        .map_err(query_err)?;
        Ok(())
    }

    fn write_closed_position(
        &self,
        session: &str,
        position: &ClosedPosition,
    ) -> Result<(), PerpError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO closed_positions (session, symbol, direction, avg_entry_price, leverage,
                cumulative_fee, amount_usd, highest_price, lowest_price, realized_pnl_usd,
                realized_pnl_percent, is_liquidated, order_count, opened_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                session,
                position.symbol,
                position.direction.as_str(),
                position.avg_entry_price,
                position.leverage,
                position.cumulative_fee,
                position.amount_usd,
                position.highest_price,
                position.lowest_price,
                position.realized_pnl_usd,
                position.realized_pnl_percent,
                position.is_liquidated,
                position.orders.len() as i64,
                format_time(position.opened_at),
                format_time(position.closed_at),
            ],
        )
        .map_err(query_err)?;
        Ok(())
    }

    fn write_result(&self, session: &str, result: &RunResult) -> Result<(), PerpError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO run_results (session, symbol, strategy, start_capital,
                positions, wins, losses, win_ratio, total_pnl_usd, total_pnl_percent,
                total_fees_usd, max_drawdown, liquidations, sharpe_ratio, sortino_ratio,
                calmar_ratio, avg_hold_minutes, hodl_percent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18)",
            params![
                session,
                result.symbol,
                result.strategy,
                result.start_capital,
                result.positions as i64,
                result.wins as i64,
                result.losses as i64,
                result.win_ratio,
                result.total_pnl_usd,
                result.total_pnl_percent,
                result.total_fees_usd,
                result.max_drawdown,
                result.liquidations as i64,
                result.sharpe_ratio,
                result.sortino_ratio,
                result.calmar_ratio,
                result.avg_hold_minutes,
                result.hodl_percent,
            ],
        )
        .map_err(query_err)?;
        Ok(())
    }
}
