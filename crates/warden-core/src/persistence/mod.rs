//! Read-through / write-back cache over the relational store.
//!
//! Reads hit the cache while fresh and fall back to the store through a dedicated
//! breaker + retry policy. Writes update the cache immediately and enqueue an op; one
//! flush coordinator commits all pending ops in a single transaction after a debounce
//! (bounded by a maximum delay) or on a periodic tick.

mod batch;
mod cache;
mod economy;
mod memory;
pub mod model;
mod store;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    domain::{ServerId, UserId},
    resilience::{BreakerConfig, Resilience, RetryPolicy},
    Error, Result,
};

pub use batch::Queued;
pub use cache::{Cache, CacheEntry};
pub use economy::{Claim, WORK_COOLDOWN, DAILY_COOLDOWN};
pub use memory::MemoryStore;
pub use model::{EconomyAccount, ServerConfig, StoredViolation, ViolationKind, ViolationRecord};
pub use store::{config_key, economy_key, Store, StoreTx, WriteOp};

use batch::BatchQueue;

#[derive(Clone, Debug)]
pub struct PersistenceSettings {
    pub default_prefix: String,
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub debounce: Duration,
    pub max_delay: Duration,
    pub flush_interval: Duration,
    pub max_pending: usize,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub timeout: Option<Duration>,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            default_prefix: model::DEFAULT_PREFIX.to_string(),
            cache_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            debounce: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            flush_interval: Duration::from_secs(5),
            max_pending: 500,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            timeout: None,
        }
    }
}

impl PersistenceSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            default_prefix: cfg.default_prefix.clone(),
            cache_ttl: cfg.cache_ttl,
            sweep_interval: cfg.cache_sweep_interval,
            debounce: cfg.batch_debounce,
            max_delay: cfg.batch_max_delay,
            flush_interval: cfg.batch_flush_interval,
            max_pending: cfg.batch_max_pending,
            retry: cfg.retry,
            breaker: cfg.breaker,
            timeout: Some(cfg.request_timeout),
        }
    }
}

/// Cheap-to-clone handle to the persistence service.
#[derive(Clone)]
pub struct Persistence {
    inner: Arc<PersistenceInner>,
}

struct PersistenceInner {
    store: Arc<dyn Store>,
    settings: PersistenceSettings,
    defaults: ServerConfig,
    resilience: Resilience,
    configs: Mutex<Cache<ServerId, ServerConfig>>,
    accounts: Mutex<Cache<UserId, EconomyAccount>>,
    queue: BatchQueue,
    /// Held by every flush and for the whole life of an explicit transaction.
    write_lock: tokio::sync::Mutex<()>,
    /// Shared by account cache writers; a committing transaction holds it exclusively.
    account_gate: tokio::sync::RwLock<()>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Persistence {
    /// Build the service without background tasks; see [`Persistence::start`].
    pub fn new(store: Arc<dyn Store>, settings: PersistenceSettings) -> Self {
        let defaults = ServerConfig::with_prefix(&settings.default_prefix);
        Self {
            inner: Arc::new(PersistenceInner {
                store,
                defaults,
                resilience: Resilience::new(
                    "store",
                    settings.retry,
                    settings.breaker,
                    settings.timeout,
                ),
                configs: Mutex::new(Cache::new(settings.cache_ttl)),
                accounts: Mutex::new(Cache::new(settings.cache_ttl)),
                queue: BatchQueue::new(settings.max_pending),
                write_lock: tokio::sync::Mutex::new(()),
                account_gate: tokio::sync::RwLock::new(()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                settings,
            }),
        }
    }

    /// Build the service and spawn its flush coordinator and cache sweep.
    pub fn open(store: Arc<dyn Store>, settings: PersistenceSettings) -> Self {
        let p = Self::new(store, settings);
        p.start();
        p
    }

    pub fn start(&self) {
        let coordinator = {
            let this = self.clone();
            tokio::spawn(async move { this.flush_loop().await })
        };
        let sweeper = {
            let this = self.clone();
            tokio::spawn(async move { this.sweep_loop().await })
        };
        lock(&self.inner.tasks).extend([coordinator, sweeper]);
    }

    pub fn defaults(&self) -> &ServerConfig {
        &self.inner.defaults
    }

    pub fn store_resilience(&self) -> &Resilience {
        &self.inner.resilience
    }

    pub fn pending_ops(&self) -> usize {
        self.inner.queue.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Store("persistence is shut down".into()));
        }
        Ok(())
    }

    // ============== Configuration ==============

    pub async fn server_config(&self, server: ServerId) -> Result<ServerConfig> {
        if let Some(cfg) = lock(&self.inner.configs).get(&server) {
            return Ok(cfg);
        }

        let store = &self.inner.store;
        let row = self
            .inner
            .resilience
            .run("load_config", || store.load_config(server))
            .await?;

        let Some(raw) = row else {
            let cfg = self.inner.defaults.clone();
            tracing::debug!(server = %server, "no stored config, persisting defaults");
            self.write_config(server, cfg.clone()).await?;
            return Ok(cfg);
        };

        let (cfg, degraded) = ServerConfig::from_stored(raw, &self.inner.defaults);
        if degraded {
            tracing::warn!(server = %server, "stored config was incomplete, back-filled from defaults");
            self.write_config(server, cfg.clone()).await?;
        } else {
            lock(&self.inner.configs).put_clean(server, cfg.clone());
        }
        Ok(cfg)
    }

    /// Replace a server's configuration; visible to readers immediately.
    pub async fn set_server_config(&self, server: ServerId, cfg: ServerConfig) -> Result<()> {
        self.write_config(server, cfg).await
    }

    /// Read-modify-write of a server's configuration.
    pub async fn update_server_config<R>(
        &self,
        server: ServerId,
        f: impl FnOnce(&mut ServerConfig) -> Result<R>,
    ) -> Result<(ServerConfig, R)> {
        let loaded = self.server_config(server).await?;
        let (cfg, out, version) = {
            let mut cache = lock(&self.inner.configs);
            let mut cfg = cache.entry(&server).map(|e| e.value.clone()).unwrap_or(loaded);
            let out = f(&mut cfg)?;
            let version = cache.put_dirty(server, cfg.clone());
            (cfg, out, version)
        };
        self.enqueue_config(server, &cfg, version).await?;
        Ok((cfg, out))
    }

    async fn write_config(&self, server: ServerId, cfg: ServerConfig) -> Result<()> {
        self.ensure_open()?;
        let version = lock(&self.inner.configs).put_dirty(server, cfg.clone());
        self.enqueue_config(server, &cfg, version).await
    }

    async fn enqueue_config(&self, server: ServerId, cfg: &ServerConfig, version: u64) -> Result<()> {
        let config = serde_json::to_value(cfg)?;
        self.enqueue(WriteOp::UpsertConfig { server, config }, version)
            .await;
        Ok(())
    }

    /// Drop a server's cached config, flushing it first if dirty.
    pub async fn forget_server(&self, server: ServerId) -> Result<()> {
        let dirty = lock(&self.inner.configs)
            .entry(&server)
            .is_some_and(|e| e.dirty);
        if dirty {
            self.flush().await?;
        }
        lock(&self.inner.configs).evict_clean(&server);
        Ok(())
    }

    // ============== Economy ==============

    pub async fn account(&self, user: UserId) -> Result<EconomyAccount> {
        let seen = {
            let cache = lock(&self.inner.accounts);
            if let Some(acc) = cache.get(&user) {
                return Ok(acc);
            }
            cache.entry(&user).map(|e| e.version)
        };

        let store = &self.inner.store;
        let row = self
            .inner
            .resilience
            .run("load_account", || store.load_account(user))
            .await?;

        let (acc, repaired) = match row {
            Some(mut acc) if !acc.is_consistent() => {
                tracing::warn!(user = %user, "stored account total out of sync, recomputing");
                acc.normalize();
                (acc, true)
            }
            Some(acc) => (acc, false),
            None => (EconomyAccount::new(user), true),
        };

        let version = {
            let _gate = self.inner.account_gate.read().await;
            let mut cache = lock(&self.inner.accounts);
            // Written while the row was loading: the cached value is newer.
            if let Some(e) = cache.entry(&user).filter(|e| Some(e.version) != seen) {
                return Ok(e.value.clone());
            }
            if !repaired {
                cache.put_clean(user, acc.clone());
                return Ok(acc);
            }
            cache.put_dirty(user, acc.clone())
        };
        self.enqueue(WriteOp::UpsertAccount(acc.clone()), version)
            .await;
        Ok(acc)
    }

    /// Replace an account; `total` is recomputed.
    pub async fn set_account(&self, mut acc: EconomyAccount) -> Result<()> {
        self.ensure_open()?;
        acc.normalize();
        let version = {
            let _gate = self.inner.account_gate.read().await;
            lock(&self.inner.accounts).put_dirty(acc.user_id, acc.clone())
        };
        self.enqueue(WriteOp::UpsertAccount(acc), version).await;
        Ok(())
    }

    /// Atomic read-modify-write against the cached account. `f` failing leaves the
    /// account untouched.
    pub async fn update_account<R>(
        &self,
        user: UserId,
        f: impl FnOnce(&mut EconomyAccount) -> Result<R>,
    ) -> Result<(EconomyAccount, R)> {
        self.ensure_open()?;
        let loaded = self.account(user).await?;
        let (acc, out, version) = {
            let _gate = self.inner.account_gate.read().await;
            let mut cache = lock(&self.inner.accounts);
            let mut acc = cache.entry(&user).map(|e| e.value.clone()).unwrap_or(loaded);
            let out = f(&mut acc)?;
            if !acc.total_fits() {
                return Err(Error::validation("balance overflow"));
            }
            acc.normalize();
            let version = cache.put_dirty(user, acc.clone());
            (acc, out, version)
        };
        self.enqueue(WriteOp::UpsertAccount(acc.clone()), version)
            .await;
        Ok((acc, out))
    }

    // ============== Violations ==============

    pub async fn record_violation(&self, record: ViolationRecord) -> Result<()> {
        self.ensure_open()?;
        self.enqueue(WriteOp::InsertViolation(record), 0).await;
        Ok(())
    }

    /// Newest first; pending violations are flushed before reading.
    pub async fn recent_violations(
        &self,
        server: ServerId,
        user: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<StoredViolation>> {
        if !self.inner.queue.is_empty() {
            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, "flush before violation read failed");
            }
        }
        let store = &self.inner.store;
        self.inner
            .resilience
            .run("recent_violations", || {
                store.recent_violations(server, user, limit)
            })
            .await
    }

    // ============== Batching ==============

    async fn enqueue(&self, op: WriteOp, version: u64) {
        if self.inner.queue.is_full() {
            tracing::debug!(pending = self.inner.queue.len(), "batch queue full, flushing inline");
            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, "inline flush failed");
            }
        }
        self.inner.queue.push(op, version);
    }

    /// Commit everything pending in one transaction. Returns the number of ops
    /// written. A failed batch is dropped; its cache entries stay dirty.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.inner.write_lock.lock().await;
        self.flush_locked().await
    }

    async fn flush_locked(&self) -> Result<usize> {
        let ops = self.inner.queue.take();
        if ops.is_empty() {
            return Ok(0);
        }

        let store = &self.inner.store;
        let ops_ref = &ops;
        let result = self
            .inner
            .resilience
            .run("commit_batch", || commit_ops(store.as_ref(), ops_ref))
            .await;

        match result {
            Ok(()) => {
                self.mark_committed(&ops);
                tracing::debug!(ops = ops.len(), "batch committed");
                Ok(ops.len())
            }
            Err(e) => {
                tracing::error!(ops_lost = ops.len(), error = %e, "batch failed, dropping");
                Err(e)
            }
        }
    }

    fn mark_committed(&self, ops: &[Queued]) {
        let mut configs = lock(&self.inner.configs);
        let mut accounts = lock(&self.inner.accounts);
        for q in ops {
            match &q.op {
                WriteOp::UpsertConfig { server, .. } => {
                    configs.mark_clean(server, q.version);
                }
                WriteOp::UpsertAccount(acc) => {
                    accounts.mark_clean(&acc.user_id, q.version);
                }
                WriteOp::InsertViolation(_) => {}
            }
        }
    }

    async fn flush_loop(self) {
        let debounce = self.inner.settings.debounce;
        let max_delay = self.inner.settings.max_delay;
        let mut tick = tokio::time::interval(self.inner.settings.flush_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.inner.queue.arrived() => {
                    let hard_deadline = Instant::now() + max_delay;
                    loop {
                        let deadline = (Instant::now() + debounce).min(hard_deadline);
                        tokio::select! {
                            _ = self.inner.cancel.cancelled() => return,
                            _ = tokio::time::sleep_until(deadline) => break,
                            _ = self.inner.queue.arrived() => {
                                if Instant::now() >= hard_deadline {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            if let Err(e) = self.flush().await {
                tracing::debug!(error = %e, "scheduled flush failed");
            }
        }
    }

    async fn sweep_loop(self) {
        let mut tick = tokio::time::interval(self.inner.settings.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tick.tick() => {
                    let evicted = self.sweep().await;
                    if evicted > 0 {
                        tracing::debug!(evicted, "cache sweep");
                    }
                }
            }
        }
    }

    /// Evict entries older than the TTL. Dirty ones are flushed first and kept if
    /// the flush fails. Returns the number of evicted entries.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let (configs, accounts) = {
            let c = lock(&self.inner.configs).expired(now);
            let a = lock(&self.inner.accounts).expired(now);
            (c, a)
        };
        if configs.is_empty() && accounts.is_empty() {
            return 0;
        }

        if self.requeue_dirty(&configs, &accounts).await > 0 {
            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, "flush before eviction failed, keeping dirty entries");
            }
        }

        let mut evicted = 0;
        {
            let mut cache = lock(&self.inner.configs);
            evicted += configs.iter().filter(|k| cache.evict_clean(k)).count();
        }
        {
            let mut cache = lock(&self.inner.accounts);
            evicted += accounts.iter().filter(|k| cache.evict_clean(k)).count();
        }
        evicted
    }

    /// Enqueue the current value of every dirty entry among the given keys.
    async fn requeue_dirty(&self, servers: &[ServerId], users: &[UserId]) -> usize {
        let configs: Vec<(ServerId, ServerConfig, u64)> = {
            let cache = lock(&self.inner.configs);
            servers
                .iter()
                .filter_map(|s| cache.entry(s).filter(|e| e.dirty).map(|e| (*s, e.value.clone(), e.version)))
                .collect()
        };
        let accounts: Vec<(EconomyAccount, u64)> = {
            let cache = lock(&self.inner.accounts);
            users
                .iter()
                .filter_map(|u| cache.entry(u).filter(|e| e.dirty).map(|e| (e.value.clone(), e.version)))
                .collect()
        };

        let n = configs.len() + accounts.len();
        for (server, cfg, version) in configs {
            match serde_json::to_value(&cfg) {
                Ok(config) => self.enqueue(WriteOp::UpsertConfig { server, config }, version).await,
                Err(e) => tracing::error!(server = %server, error = %e, "config not serialisable"),
            }
        }
        for (acc, version) in accounts {
            self.enqueue(WriteOp::UpsertAccount(acc), version).await;
        }
        n
    }

    // ============== Transactions ==============

    /// Open an explicit transaction. Pending batches are committed first and no
    /// batch runs until the transaction ends.
    pub async fn begin(&self) -> Result<Transaction<'_>> {
        self.ensure_open()?;
        let guard = self.inner.write_lock.lock().await;
        if let Err(e) = self.flush_locked().await {
            tracing::warn!(error = %e, "draining before transaction failed");
        }
        let store = &self.inner.store;
        let tx = self
            .inner
            .resilience
            .run("begin", || store.begin())
            .await?;
        Ok(Transaction {
            persistence: self,
            tx: Some(tx),
            read: HashMap::new(),
            touched: Vec::new(),
            _guard: guard,
        })
    }

    // ============== Shutdown ==============

    /// Flush dirty entries, stop background tasks and close the store. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        for t in tasks {
            let _ = t.await;
        }

        let servers: Vec<ServerId> = lock(&self.inner.configs).dirty().into_iter().map(|(k, _, _)| k).collect();
        let users: Vec<UserId> = lock(&self.inner.accounts).dirty().into_iter().map(|(k, _, _)| k).collect();
        self.requeue_dirty(&servers, &users).await;

        match self.flush().await {
            Ok(n) => tracing::info!(ops = n, "persistence flushed on shutdown"),
            Err(e) => tracing::error!(error = %e, "final flush failed"),
        }
        self.inner.store.close().await;
    }
}

async fn commit_ops(store: &dyn Store, ops: &[Queued]) -> Result<()> {
    let mut tx = store.begin().await?;
    for q in ops {
        if let Err(e) = q.op.apply(tx.as_mut()).await {
            if let Err(rb) = tx.rollback().await {
                tracing::warn!(error = %rb, "rollback failed");
            }
            return Err(e);
        }
    }
    tx.commit().await
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Explicit store transaction over economy accounts.
///
/// Accounts read through the transaction must not be written through the cache
/// before it commits; if one is, [`Transaction::commit`] rolls back with
/// [`Error::Conflict`]. Dropping it without committing rolls back.
pub struct Transaction<'a> {
    persistence: &'a Persistence,
    tx: Option<Box<dyn StoreTx>>,
    /// Cache version of each account when it was first read.
    read: HashMap<UserId, Option<u64>>,
    touched: Vec<EconomyAccount>,
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl Transaction<'_> {
    fn tx(&mut self) -> Result<&mut Box<dyn StoreTx>> {
        self.tx
            .as_mut()
            .ok_or_else(|| Error::Store("transaction already finished".into()))
    }

    pub async fn account(&mut self, user: UserId) -> Result<EconomyAccount> {
        if let Some(acc) = self.touched.iter().find(|a| a.user_id == user) {
            return Ok(acc.clone());
        }
        // A dirty cache entry is newer than the store.
        let cached = {
            let cache = lock(&self.persistence.inner.accounts);
            let entry = cache.entry(&user);
            self.read
                .entry(user)
                .or_insert_with(|| entry.map(|e| e.version));
            entry.filter(|e| e.dirty).map(|e| e.value.clone())
        };
        if let Some(acc) = cached {
            return Ok(acc);
        }
        let stored = self.tx()?.load_account(user).await?;
        let mut acc = stored.unwrap_or_else(|| EconomyAccount::new(user));
        acc.normalize();
        Ok(acc)
    }

    pub async fn put_account(&mut self, mut acc: EconomyAccount) -> Result<()> {
        acc.normalize();
        self.tx()?.upsert_account(&acc).await?;
        self.touched.retain(|a| a.user_id != acc.user_id);
        self.touched.push(acc);
        Ok(())
    }

    /// Commit, then publish the touched accounts to the cache as clean and discard
    /// any pending ops for them. Fails with [`Error::Conflict`], after rolling back,
    /// when an account read by this transaction was written through the cache since.
    pub async fn commit(mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Store("transaction already finished".into()))?;
        let inner = &self.persistence.inner;
        let _gate = inner.account_gate.write().await;

        if let Some(user) = self.changed_since_read() {
            tracing::debug!(user = %user, "account changed during transaction, rolling back");
            if let Err(e) = tx.rollback().await {
                tracing::warn!(error = %e, "rollback failed");
            }
            return Err(Error::Conflict(format!("account {user} changed during transaction")));
        }
        tx.commit().await?;

        let keys: Vec<String> = self.touched.iter().map(|a| economy_key(a.user_id)).collect();
        inner.queue.discard(&keys);
        let mut cache = lock(&inner.accounts);
        for acc in self.touched.drain(..) {
            cache.put_clean(acc.user_id, acc);
        }
        Ok(())
    }

    /// First account whose cache entry picked up a local write after it was read.
    /// Clean entries match the store, which no batch can change while the
    /// transaction holds the write lock.
    fn changed_since_read(&self) -> Option<UserId> {
        let cache = lock(&self.persistence.inner.accounts);
        self.read.iter().find_map(|(user, seen)| {
            cache
                .entry(user)
                .filter(|e| e.dirty && Some(e.version) != *seen)
                .map(|_| *user)
        })
    }

    pub async fn rollback(mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!("transaction dropped without commit, rolling back");
        }
    }
}

#[cfg(test)]
mod tests;
