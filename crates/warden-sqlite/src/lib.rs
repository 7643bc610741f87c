//! SQLite implementation of the warden [`Store`].
//!
//! Ids are stored as INTEGER, timestamps as Unix milliseconds and structured
//! columns (server configs, inventories) as JSON text.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row, Sqlite, Transaction,
};
use warden_core::{
    domain::{ChannelId, MessageId, ServerId, UserId},
    persistence::{
        EconomyAccount, Store, StoreTx, StoredViolation, ViolationKind, ViolationRecord,
    },
    Error, Result,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS economy (
        user_id INTEGER PRIMARY KEY,
        balance INTEGER NOT NULL DEFAULT 0,
        bank INTEGER NOT NULL DEFAULT 0,
        last_daily INTEGER,
        last_work INTEGER,
        work_streak INTEGER NOT NULL DEFAULT 0,
        inventory TEXT NOT NULL DEFAULT '{}',
        total INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS server_configs (
        server_id INTEGER PRIMARY KEY,
        config TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS automod_violations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT NOT NULL,
        server_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        message_id INTEGER,
        timestamp INTEGER NOT NULL,
        details TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_violations_server_user
        ON automod_violations (server_id, user_id, timestamp)",
];

// SQLITE_BUSY and SQLITE_LOCKED, including their extended codes.
const BUSY: i32 = 5;
const LOCKED: i32 = 6;

/// Translate a driver error into the runtime's error taxonomy.
fn db_err(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Error::Transient(e.to_string()),
        sqlx::Error::Database(ref db) => {
            let code = db.code().and_then(|c| c.parse::<i32>().ok()).unwrap_or(0);
            match code & 0xff {
                BUSY | LOCKED => Error::Transient(db.message().to_string()),
                _ => Error::Store(db.message().to_string()),
            }
        }
        other => Error::Store(other.to_string()),
    }
}

fn to_millis(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(|t| t.timestamp_millis())
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    ///
    /// Any failure here is an [`Error::Init`]: the bot cannot start without its store.
    pub async fn connect(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| Error::Init(format!("invalid database url {url}: {e}")))?
            .create_if_missing(true)
            .journal_mode(if in_memory {
                SqliteJournalMode::Memory
            } else {
                SqliteJournalMode::Wal
            });

        // Every connection to `:memory:` is its own database, so pin a single one.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| Error::Init(format!("open {url}: {e}")))?;

        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&pool)
                .await
                .map_err(|e| Error::Init(format!("apply schema: {e}")))?;
        }

        tracing::info!(url, "sqlite store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn account_from_row(row: &SqliteRow) -> Result<EconomyAccount> {
    let user_id = UserId(row.try_get("user_id").map_err(db_err)?);
    let raw_inventory: String = row.try_get("inventory").map_err(db_err)?;
    let inventory = serde_json::from_str(&raw_inventory).unwrap_or_else(|e| {
        tracing::warn!(user = %user_id, error = %e, "unreadable inventory, starting empty");
        Default::default()
    });
    let streak: i64 = row.try_get("work_streak").map_err(db_err)?;

    Ok(EconomyAccount {
        user_id,
        balance: row.try_get("balance").map_err(db_err)?,
        bank: row.try_get("bank").map_err(db_err)?,
        last_daily: from_millis(row.try_get("last_daily").map_err(db_err)?),
        last_work: from_millis(row.try_get("last_work").map_err(db_err)?),
        work_streak: u32::try_from(streak).unwrap_or(0),
        inventory,
        total: row.try_get("total").map_err(db_err)?,
    })
}

fn violation_from_row(row: &SqliteRow) -> Result<Option<StoredViolation>> {
    let id: i64 = row.try_get("id").map_err(db_err)?;
    let kind: String = row.try_get("type").map_err(db_err)?;
    let Some(kind) = ViolationKind::parse(&kind) else {
        tracing::warn!(id, kind, "skipping violation with unknown type");
        return Ok(None);
    };
    let ts: i64 = row.try_get("timestamp").map_err(db_err)?;

    Ok(Some(StoredViolation {
        id,
        record: ViolationRecord {
            kind,
            server_id: ServerId(row.try_get("server_id").map_err(db_err)?),
            user_id: UserId(row.try_get("user_id").map_err(db_err)?),
            channel_id: ChannelId(row.try_get("channel_id").map_err(db_err)?),
            message_id: row
                .try_get::<Option<i64>, _>("message_id")
                .map_err(db_err)?
                .map(MessageId),
            timestamp: DateTime::from_timestamp_millis(ts).unwrap_or_default(),
            details: row.try_get("details").map_err(db_err)?,
        },
    }))
}

const SELECT_ACCOUNT: &str = "SELECT user_id, balance, bank, last_daily, last_work, work_streak, inventory, total
     FROM economy WHERE user_id = ?";

#[async_trait]
impl Store for SqliteStore {
    async fn load_config(&self, server: ServerId) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT config FROM server_configs WHERE server_id = ?")
            .bind(server.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        let Some(row) = row else { return Ok(None) };
        let raw: String = row.try_get("config").map_err(db_err)?;
        match serde_json::from_str(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                // An unparseable row is repaired from defaults by the caller.
                tracing::warn!(server = %server, error = %e, "stored config is not valid JSON");
                Ok(Some(Value::Null))
            }
        }
    }

    async fn load_account(&self, user: UserId) -> Result<Option<EconomyAccount>> {
        let row = sqlx::query(SELECT_ACCOUNT)
            .bind(user.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn recent_violations(
        &self,
        server: ServerId,
        user: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<StoredViolation>> {
        let rows = sqlx::query(
            "SELECT id, type, server_id, user_id, channel_id, message_id, timestamp, details
             FROM automod_violations
             WHERE server_id = ? AND (? IS NULL OR user_id = ?)
             ORDER BY timestamp DESC, id DESC
             LIMIT ?",
        )
        .bind(server.0)
        .bind(user.map(|u| u.0))
        .bind(user.map(|u| u.0))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(v) = violation_from_row(row)? {
                out.push(v);
            }
        }
        Ok(out)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(SqliteTx { tx }))
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("sqlite store closed");
    }
}

/// Open SQLite transaction. sqlx rolls it back when dropped uncommitted.
pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn load_account(&mut self, user: UserId) -> Result<Option<EconomyAccount>> {
        let row = sqlx::query(SELECT_ACCOUNT)
            .bind(user.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn upsert_config(&mut self, server: ServerId, config: &Value) -> Result<()> {
        let raw = serde_json::to_string(config)?;
        sqlx::query(
            "INSERT INTO server_configs (server_id, config, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(server_id) DO UPDATE SET config = excluded.config, updated_at = excluded.updated_at",
        )
        .bind(server.0)
        .bind(raw)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_account(&mut self, account: &EconomyAccount) -> Result<()> {
        let inventory = serde_json::to_string(&account.inventory)?;
        sqlx::query(
            "INSERT INTO economy (user_id, balance, bank, last_daily, last_work, work_streak, inventory, total)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                balance = excluded.balance,
                bank = excluded.bank,
                last_daily = excluded.last_daily,
                last_work = excluded.last_work,
                work_streak = excluded.work_streak,
                inventory = excluded.inventory,
                total = excluded.total",
        )
        .bind(account.user_id.0)
        .bind(account.balance)
        .bind(account.bank)
        .bind(to_millis(account.last_daily))
        .bind(to_millis(account.last_work))
        .bind(i64::from(account.work_streak))
        .bind(inventory)
        .bind(account.balance + account.bank)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_violation(&mut self, record: &ViolationRecord) -> Result<i64> {
        let done = sqlx::query(
            "INSERT INTO automod_violations
                (type, server_id, user_id, channel_id, message_id, timestamp, details)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.kind.as_str())
        .bind(record.server_id.0)
        .bind(record.user_id.0)
        .bind(record.channel_id.0)
        .bind(record.message_id.map(|m| m.0))
        .bind(record.timestamp.timestamp_millis())
        .bind(&record.details)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(done.last_insert_rowid())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(db_err)
    }
}
