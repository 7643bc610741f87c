use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::Notify;

use crate::persistence::store::WriteOp;

/// A queued op plus the cache version it carries (0 for append-only ops).
#[derive(Clone, Debug)]
pub struct Queued {
    pub op: WriteOp,
    pub version: u64,
}

#[derive(Debug, Default)]
struct Pending {
    order: Vec<String>,
    by_key: HashMap<String, Vec<Queued>>,
    len: usize,
}

/// Pending write ops grouped by key, drained in key-insertion order.
#[derive(Debug)]
pub struct BatchQueue {
    pending: Mutex<Pending>,
    arrivals: Notify,
    max_pending: usize,
}

impl BatchQueue {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            arrivals: Notify::new(),
            max_pending: max_pending.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_full(&self) -> bool {
        self.lock().len >= self.max_pending
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upserts replace the previous op for their key; inserts append.
    pub fn push(&self, op: WriteOp, version: u64) {
        let key = op.key();
        let replaces = !matches!(op, WriteOp::InsertViolation(_));
        {
            let mut guard = self.lock();
            let p = &mut *guard;
            if !p.by_key.contains_key(&key) {
                p.order.push(key.clone());
            }
            let ops = p.by_key.entry(key).or_default();
            let added = if replaces && !ops.is_empty() {
                ops.clear();
                0
            } else {
                1
            };
            ops.push(Queued { op, version });
            p.len += added;
        }
        self.arrivals.notify_one();
    }

    /// Remove and return everything pending, in key-insertion order.
    pub fn take(&self) -> Vec<Queued> {
        let mut p = self.lock();
        let Pending { order, mut by_key, .. } = std::mem::take(&mut *p);
        order
            .into_iter()
            .flat_map(|k| by_key.remove(&k).unwrap_or_default())
            .collect()
    }

    /// Drop pending ops for `keys`; returns how many were dropped.
    pub fn discard(&self, keys: &[String]) -> usize {
        let mut p = self.lock();
        let mut dropped = 0;
        for key in keys {
            if let Some(ops) = p.by_key.remove(key) {
                dropped += ops.len();
            }
        }
        p.order.retain(|k| !keys.contains(k));
        p.len -= dropped;
        dropped
    }

    /// Resolves after the next `push`.
    pub async fn arrived(&self) {
        self.arrivals.notified().await
    }
}
