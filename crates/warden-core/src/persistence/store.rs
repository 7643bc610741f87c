use async_trait::async_trait;
use serde_json::Value;

use crate::{
    domain::{ServerId, UserId},
    persistence::model::{EconomyAccount, StoredViolation, ViolationRecord},
    Result,
};

/// Relational backing store.
///
/// Implementations never retry; the persistence service wraps calls in its own
/// breaker and retry policy.
#[async_trait]
pub trait Store: Send + Sync {
    /// Raw JSON of a server's configuration row, if one exists.
    async fn load_config(&self, server: ServerId) -> Result<Option<Value>>;

    async fn load_account(&self, user: UserId) -> Result<Option<EconomyAccount>>;

    /// Newest first. `user == None` returns violations for every user of the server.
    async fn recent_violations(
        &self,
        server: ServerId,
        user: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<StoredViolation>>;

    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    async fn close(&self);
}

/// One open store transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait StoreTx: Send {
    async fn load_account(&mut self, user: UserId) -> Result<Option<EconomyAccount>>;

    async fn upsert_config(&mut self, server: ServerId, config: &Value) -> Result<()>;

    async fn upsert_account(&mut self, account: &EconomyAccount) -> Result<()>;

    /// Returns the new row id.
    async fn insert_violation(&mut self, record: &ViolationRecord) -> Result<i64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// One queued mutation. Ops sharing a key are idempotent; the last one wins.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    UpsertConfig { server: ServerId, config: Value },
    UpsertAccount(EconomyAccount),
    InsertViolation(ViolationRecord),
}

impl WriteOp {
    pub fn key(&self) -> String {
        match self {
            WriteOp::UpsertConfig { server, .. } => config_key(*server),
            WriteOp::UpsertAccount(acc) => economy_key(acc.user_id),
            WriteOp::InsertViolation(v) => format!("violation:{}:{}", v.server_id, v.user_id),
        }
    }

    pub(crate) async fn apply(&self, tx: &mut dyn StoreTx) -> Result<()> {
        match self {
            WriteOp::UpsertConfig { server, config } => tx.upsert_config(*server, config).await,
            WriteOp::UpsertAccount(acc) => tx.upsert_account(acc).await,
            WriteOp::InsertViolation(v) => tx.insert_violation(v).await.map(|_| ()),
        }
    }
}

pub fn config_key(server: ServerId) -> String {
    format!("config:{server}")
}

pub fn economy_key(user: UserId) -> String {
    format!("economy:{user}")
}
