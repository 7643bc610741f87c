use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    domain::{ServerId, UserId},
    persistence::{
        model::{EconomyAccount, StoredViolation, ViolationRecord},
        store::{Store, StoreTx},
    },
    Error, Result,
};

#[derive(Debug, Default)]
struct Tables {
    configs: HashMap<ServerId, Value>,
    accounts: HashMap<UserId, EconomyAccount>,
    violations: Vec<StoredViolation>,
    next_violation_id: i64,
}

#[derive(Debug, Default)]
struct Inner {
    tables: Mutex<Tables>,
    fail_commits: AtomicU32,
    fail_reads: AtomicU32,
    commits: AtomicU32,
    closed: AtomicBool,
}

impl Inner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_read(&self) -> Result<()> {
        if take_one(&self.fail_reads) {
            return Err(Error::Transient("memory store: injected read failure".into()));
        }
        Ok(())
    }
}

/// In-process store. Selected with `DATABASE_URL=memory:` and used throughout the tests.
///
/// Transactions stage their writes and apply them atomically on commit.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transient error.
    pub fn fail_commits(&self, n: u32) {
        self.inner.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads fail with a transient error.
    pub fn fail_reads(&self, n: u32) {
        self.inner.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Number of successfully committed transactions.
    pub fn commits(&self) -> u32 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Committed config row, bypassing any cache.
    pub fn config_row(&self, server: ServerId) -> Option<Value> {
        self.inner.tables().configs.get(&server).cloned()
    }

    pub fn account_row(&self, user: UserId) -> Option<EconomyAccount> {
        self.inner.tables().accounts.get(&user).cloned()
    }

    pub fn violation_count(&self) -> usize {
        self.inner.tables().violations.len()
    }

    /// Seed a raw config row, e.g. one written by an older deployment.
    pub fn put_config_row(&self, server: ServerId, config: Value) {
        self.inner.tables().configs.insert(server, config);
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_config(&self, server: ServerId) -> Result<Option<Value>> {
        self.inner.check_read()?;
        Ok(self.inner.tables().configs.get(&server).cloned())
    }

    async fn load_account(&self, user: UserId) -> Result<Option<EconomyAccount>> {
        self.inner.check_read()?;
        Ok(self.inner.tables().accounts.get(&user).cloned())
    }

    async fn recent_violations(
        &self,
        server: ServerId,
        user: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<StoredViolation>> {
        self.inner.check_read()?;
        let tables = self.inner.tables();
        Ok(tables
            .violations
            .iter()
            .rev()
            .filter(|v| v.record.server_id == server)
            .filter(|v| user.map_or(true, |u| v.record.user_id == u))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        if self.is_closed() {
            return Err(Error::Store("memory store is closed".into()));
        }
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            configs: Vec::new(),
            accounts: HashMap::new(),
            violations: Vec::new(),
        }))
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryTx {
    inner: Arc<Inner>,
    configs: Vec<(ServerId, Value)>,
    accounts: HashMap<UserId, EconomyAccount>,
    violations: Vec<ViolationRecord>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn load_account(&mut self, user: UserId) -> Result<Option<EconomyAccount>> {
        if let Some(staged) = self.accounts.get(&user) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.inner.tables().accounts.get(&user).cloned())
    }

    async fn upsert_config(&mut self, server: ServerId, config: &Value) -> Result<()> {
        self.configs.push((server, config.clone()));
        Ok(())
    }

    async fn upsert_account(&mut self, account: &EconomyAccount) -> Result<()> {
        let mut account = account.clone();
        account.normalize();
        self.accounts.insert(account.user_id, account);
        Ok(())
    }

    async fn insert_violation(&mut self, record: &ViolationRecord) -> Result<i64> {
        self.violations.push(record.clone());
        let tables = self.inner.tables();
        Ok(tables.next_violation_id + self.violations.len() as i64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if take_one(&self.inner.fail_commits) {
            return Err(Error::Transient("memory store: injected commit failure".into()));
        }
        let this = *self;
        let mut tables = this.inner.tables();
        for (server, config) in this.configs {
            tables.configs.insert(server, config);
        }
        for (user, account) in this.accounts {
            tables.accounts.insert(user, account);
        }
        for record in this.violations {
            tables.next_violation_id += 1;
            let id = tables.next_violation_id;
            tables.violations.push(StoredViolation { id, record });
        }
        drop(tables);
        this.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
