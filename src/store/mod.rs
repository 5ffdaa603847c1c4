// =============================================================================
// SQLite Store — persisted engine state
// =============================================================================
//
// WAL mode for concurrent reads during writes; all access goes through a
// single connection behind a parking_lot Mutex. Writes are row-scoped by
// (account, entity), so the coarse lock is never held across an await.
//
// Table layout follows the persisted-state schema: accounts, secret
// envelopes, provider API keys, strategies, orders, positions, portfolio
// snapshots, the trade journal, monitoring + AI-usage logs, learning records
// and trade evaluations.
// =============================================================================

pub mod accounts;
pub mod journal;
pub mod learnings;
pub mod snapshots;
pub mod strategies;
pub mod usage;

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

pub use accounts::{AccountRow, ApiKeyRow, MonitoringLogRow};
pub use journal::{JournalEntryRow, JournalStatus, OrderRow, PositionRow};
pub use learnings::{LearningRow, TradeEvaluationRow};
pub use snapshots::SnapshotRow;
pub use strategies::StrategyRow;
pub use usage::AiUsageRow;

/// Shared SQLite-backed store.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: &str) -> Result<Arc<Self>> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        let store = Self::init(conn)?;
        info!(path, "store opened");
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Arc<Self>> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;

        conn.execute_batch(SCHEMA).context("failed to initialise schema")?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    /// Current timestamp in the store's canonical string form.
    pub fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS account (
    id                              TEXT PRIMARY KEY,
    role                            TEXT NOT NULL DEFAULT 'user',
    verification_status             TEXT NOT NULL DEFAULT 'pending',
    agent_mode                      TEXT NOT NULL DEFAULT 'passive',
    monitoring_frequency_minutes    INTEGER NOT NULL DEFAULT 0,
    main_wallet_address             TEXT,
    created_at                      TEXT NOT NULL,
    deleted_at                      TEXT
);

CREATE TABLE IF NOT EXISTS secret_envelope (
    account_id          TEXT PRIMARY KEY REFERENCES account(id),
    encrypted_payload   BLOB NOT NULL,
    payload_iv          BLOB NOT NULL,
    encrypted_dek       BLOB NOT NULL,
    dek_iv              BLOB NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS api_key (
    id                  TEXT PRIMARY KEY,
    account_id          TEXT NOT NULL REFERENCES account(id),
    provider_type       TEXT NOT NULL,
    provider_name       TEXT NOT NULL,
    label               TEXT NOT NULL DEFAULT '',
    encrypted_api_key   BLOB NOT NULL,
    api_key_iv          BLOB NOT NULL,
    encrypted_dek       BLOB NOT NULL,
    dek_iv              BLOB NOT NULL,
    metadata            TEXT NOT NULL DEFAULT '{}',
    is_active           INTEGER NOT NULL DEFAULT 1,
    created_at          TEXT NOT NULL,
    last_used           TEXT
);
CREATE INDEX IF NOT EXISTS idx_api_key_account ON api_key(account_id, provider_type, is_active);

CREATE TABLE IF NOT EXISTS strategy (
    id                          TEXT PRIMARY KEY,
    account_id                  TEXT NOT NULL REFERENCES account(id),
    name                        TEXT NOT NULL,
    kind                        TEXT NOT NULL,
    is_active                   INTEGER NOT NULL DEFAULT 1,
    allocated_percent           REAL NOT NULL DEFAULT 0,
    max_positions               INTEGER NOT NULL DEFAULT 1,
    max_leverage                INTEGER NOT NULL DEFAULT 1,
    daily_loss_limit_percent    REAL NOT NULL DEFAULT 0,
    current_daily_loss          REAL NOT NULL DEFAULT 0,
    config                      TEXT NOT NULL DEFAULT '{}',
    status                      TEXT NOT NULL DEFAULT 'ok'
);
CREATE INDEX IF NOT EXISTS idx_strategy_account ON strategy(account_id, is_active);

CREATE TABLE IF NOT EXISTS trade_order (
    id          TEXT PRIMARY KEY,
    account_id  TEXT NOT NULL REFERENCES account(id),
    strategy_id TEXT NOT NULL,
    symbol      TEXT NOT NULL,
    side        TEXT NOT NULL,
    size        REAL NOT NULL,
    price       REAL NOT NULL,
    order_type  TEXT NOT NULL,
    reduce_only INTEGER NOT NULL DEFAULT 0,
    venue_oid   INTEGER,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_order_account ON trade_order(account_id, created_at);

CREATE TABLE IF NOT EXISTS position (
    id           TEXT PRIMARY KEY,
    account_id   TEXT NOT NULL REFERENCES account(id),
    strategy_id  TEXT NOT NULL,
    symbol       TEXT NOT NULL,
    side         TEXT NOT NULL,
    size         REAL NOT NULL,
    entry_price  REAL NOT NULL,
    leverage     INTEGER NOT NULL DEFAULT 1,
    status       TEXT NOT NULL DEFAULT 'open',
    opened_at    TEXT NOT NULL,
    closed_at    TEXT,
    realized_pnl REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_position_account ON position(account_id, status);
CREATE INDEX IF NOT EXISTS idx_position_strategy ON position(strategy_id, status);

CREATE TABLE IF NOT EXISTS portfolio_snapshot (
    id             TEXT PRIMARY KEY,
    account_id     TEXT NOT NULL REFERENCES account(id),
    account_value  REAL NOT NULL,
    margin_used    REAL NOT NULL,
    position_count INTEGER NOT NULL,
    detail         TEXT NOT NULL DEFAULT '{}',
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshot_account ON portfolio_snapshot(account_id, created_at);

CREATE TABLE IF NOT EXISTS trade_journal (
    id              TEXT PRIMARY KEY,
    account_id      TEXT NOT NULL REFERENCES account(id),
    strategy_id     TEXT NOT NULL,
    symbol          TEXT NOT NULL,
    side            TEXT NOT NULL,
    status          TEXT NOT NULL CHECK (status IN ('planned','active','closed')),
    entry_reasoning TEXT NOT NULL DEFAULT '',
    expectations    TEXT NOT NULL DEFAULT '',
    planned_entry   REAL,
    planned_stop    REAL,
    planned_target  REAL,
    entry_price     REAL,
    exit_price      REAL,
    size            REAL,
    pnl             REAL,
    close_analysis  TEXT,
    created_at      TEXT NOT NULL,
    activated_at    TEXT,
    closed_at       TEXT
);
CREATE INDEX IF NOT EXISTS idx_journal_account ON trade_journal(account_id, status);

CREATE TABLE IF NOT EXISTS monitoring_log (
    id           TEXT PRIMARY KEY,
    account_id   TEXT NOT NULL REFERENCES account(id),
    state        TEXT NOT NULL,
    triggered_by TEXT NOT NULL,
    outcome      TEXT NOT NULL DEFAULT '',
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_monitoring_account ON monitoring_log(account_id, created_at);

CREATE TABLE IF NOT EXISTS ai_usage_log (
    id                TEXT PRIMARY KEY,
    account_id        TEXT NOT NULL REFERENCES account(id),
    provider          TEXT NOT NULL,
    model             TEXT NOT NULL,
    prompt_tokens     INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    estimated_cost    REAL NOT NULL DEFAULT 0,
    success           INTEGER NOT NULL,
    user_prompt       TEXT NOT NULL DEFAULT '',
    created_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_account ON ai_usage_log(account_id, created_at);

CREATE TABLE IF NOT EXISTS learning_record (
    id               TEXT PRIMARY KEY,
    account_id       TEXT NOT NULL REFERENCES account(id),
    category         TEXT NOT NULL,
    subcategory      TEXT NOT NULL,
    content          TEXT NOT NULL,
    sample_size      INTEGER NOT NULL DEFAULT 1,
    confidence_score REAL NOT NULL DEFAULT 0,
    decay_weight     REAL NOT NULL DEFAULT 1.0,
    is_active        INTEGER NOT NULL DEFAULT 1,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_learning_account ON learning_record(account_id, is_active);

CREATE TABLE IF NOT EXISTS trade_evaluation (
    id         TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES account(id),
    journal_id TEXT NOT NULL,
    pnl        REAL NOT NULL,
    target_hit INTEGER NOT NULL,
    regime     TEXT NOT NULL,
    score      REAL NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_evaluation_account ON trade_evaluation(account_id, created_at);

CREATE TABLE IF NOT EXISTS aggregation_run (
    account_id TEXT PRIMARY KEY REFERENCES account(id),
    ran_at     TEXT NOT NULL
);
"#;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initialises_cleanly() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(count >= 12);
    }

    #[test]
    fn schema_init_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.conn.lock().execute_batch(SCHEMA).unwrap();
    }
}
