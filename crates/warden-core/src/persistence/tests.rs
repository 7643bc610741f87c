use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use serde_json::json;

use super::*;
use crate::domain::{ChannelId, MessageId};

fn settings() -> PersistenceSettings {
    PersistenceSettings {
        retry: RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        },
        ..PersistenceSettings::default()
    }
}

fn service() -> (Persistence, MemoryStore) {
    let store = MemoryStore::new();
    let p = Persistence::new(Arc::new(store.clone()), settings());
    (p, store)
}

fn funded(user: i64, balance: i64, bank: i64) -> EconomyAccount {
    let mut acc = EconomyAccount::new(UserId(user));
    acc.balance = balance;
    acc.bank = bank;
    acc
}

#[tokio::test(start_paused = true)]
async fn config_survives_eviction() {
    let (p, store) = service();
    let mut cfg = ServerConfig::with_prefix("?");
    cfg.automod.enabled = true;
    cfg.security.disabled_commands.push("pay".into());

    p.set_server_config(ServerId(1), cfg.clone()).await.unwrap();
    assert_eq!(p.server_config(ServerId(1)).await.unwrap(), cfg);
    assert_eq!(p.flush().await.unwrap(), 1);

    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(p.sweep().await, 1);

    let commits = store.commits();
    assert_eq!(p.server_config(ServerId(1)).await.unwrap(), cfg);
    assert_eq!(store.commits(), commits);
}

#[tokio::test]
async fn missing_config_is_synthesised_and_persisted() {
    let (p, store) = service();
    let cfg = p.server_config(ServerId(5)).await.unwrap();
    assert_eq!(cfg.prefix, "!");
    assert_eq!(p.pending_ops(), 1);

    p.flush().await.unwrap();
    let row = store.config_row(ServerId(5)).unwrap();
    assert_eq!(row["prefix"], "!");
}

#[tokio::test]
async fn legacy_config_rows_are_repaired() {
    let (p, store) = service();
    store.put_config_row(
        ServerId(2),
        json!({ "prefix": "$", "owners": ["12"], "automod": { "spam": { "threshold": "lots" } } }),
    );

    let cfg = p.server_config(ServerId(2)).await.unwrap();
    assert_eq!(cfg.prefix, "$");
    assert_eq!(cfg.owners, vec![UserId(12)]);
    assert_eq!(cfg.automod.spam.threshold, 5);

    p.flush().await.unwrap();
    let row = store.config_row(ServerId(2)).unwrap();
    assert_eq!(row["automod"]["spam"]["threshold"], 5);
    assert_eq!(row["features"]["economy"], true);
}

#[tokio::test]
async fn writes_coalesce_into_one_commit() {
    let (p, store) = service();
    for balance in [10, 20, 30] {
        p.set_account(funded(1, balance, 0)).await.unwrap();
    }
    p.set_account(funded(2, 5, 5)).await.unwrap();
    assert_eq!(p.pending_ops(), 2);

    assert_eq!(p.flush().await.unwrap(), 2);
    assert_eq!(store.commits(), 1);
    assert_eq!(store.account_row(UserId(1)).unwrap().balance, 30);
    assert_eq!(store.account_row(UserId(2)).unwrap().total, 10);
}

#[tokio::test]
async fn failed_batch_is_dropped_and_retried_at_shutdown() {
    let (p, store) = service();
    store.fail_commits(1);
    p.set_account(funded(3, 40, 0)).await.unwrap();

    assert!(p.flush().await.is_err());
    assert_eq!(p.pending_ops(), 0);
    assert!(store.account_row(UserId(3)).is_none());
    // Still served from cache while dirty.
    assert_eq!(p.account(UserId(3)).await.unwrap().balance, 40);

    p.shutdown().await;
    assert_eq!(store.account_row(UserId(3)).unwrap().balance, 40);
    assert!(store.is_closed());
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let (p, store) = service();
    p.start();
    p.set_account(funded(1, 1, 0)).await.unwrap();
    p.shutdown().await;
    let commits = store.commits();
    p.shutdown().await;
    assert_eq!(store.commits(), commits);
    assert!(p.set_account(funded(1, 2, 0)).await.is_err());
}

#[tokio::test]
async fn full_queue_flushes_inline() {
    let store = MemoryStore::new();
    let p = Persistence::new(
        Arc::new(store.clone()),
        PersistenceSettings {
            max_pending: 2,
            ..settings()
        },
    );
    p.set_account(funded(1, 1, 0)).await.unwrap();
    p.set_account(funded(2, 1, 0)).await.unwrap();
    assert_eq!(store.commits(), 0);

    p.set_account(funded(3, 1, 0)).await.unwrap();
    assert_eq!(store.commits(), 1);
    assert_eq!(p.pending_ops(), 1);
}

#[tokio::test(start_paused = true)]
async fn coordinator_flushes_after_debounce() {
    let store = MemoryStore::new();
    let p = Persistence::open(Arc::new(store.clone()), settings());
    p.set_account(funded(9, 7, 0)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.account_row(UserId(9)).is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.account_row(UserId(9)).unwrap().balance, 7);
    p.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn steady_writes_still_flush_by_max_delay() {
    let store = MemoryStore::new();
    let p = Persistence::open(Arc::new(store.clone()), settings());

    for i in 0..12 {
        p.set_account(funded(1, i, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    // 2.4s of writes every 200ms never leave a 250ms gap.
    assert!(store.commits() >= 1);
    p.shutdown().await;
}

#[tokio::test]
async fn totals_hold_after_every_mutation() {
    let (p, store) = service();
    let user = UserId(1);

    let acc = p.add_balance(user, 100).await.unwrap();
    assert_eq!(acc.total, 100);
    let acc = p.deposit(user, 60).await.unwrap();
    assert_eq!((acc.balance, acc.bank, acc.total), (40, 60, 100));
    let acc = p.withdraw(user, 10).await.unwrap();
    assert_eq!((acc.balance, acc.bank, acc.total), (50, 50, 100));

    assert!(matches!(p.deposit(user, 51).await, Err(Error::Validation(_))));
    assert!(matches!(p.withdraw(user, 0).await, Err(Error::Validation(_))));
    assert!(matches!(p.add_balance(user, -51).await, Err(Error::Validation(_))));

    p.flush().await.unwrap();
    let row = store.account_row(user).unwrap();
    assert_eq!(row.balance + row.bank, row.total);
    assert_eq!(row.total, 100);
}

#[tokio::test]
async fn transfer_moves_funds_atomically() {
    let (p, store) = service();
    p.set_account(funded(1, 100, 0)).await.unwrap();
    p.set_account(funded(2, 5, 20)).await.unwrap();

    let (a, b) = p.transfer(UserId(1), UserId(2), 30).await.unwrap();
    assert_eq!((a.balance, a.total), (70, 70));
    assert_eq!((b.balance, b.total), (35, 55));
    assert_eq!(a.total + b.total, 125);

    assert_eq!(store.account_row(UserId(1)).unwrap().balance, 70);
    assert_eq!(store.account_row(UserId(2)).unwrap().balance, 35);
    assert_eq!(p.pending_ops(), 0);
    assert_eq!(p.account(UserId(2)).await.unwrap().balance, 35);
}

#[tokio::test]
async fn transfer_rejections_leave_balances_alone() {
    let (p, store) = service();
    p.set_account(funded(1, 10, 0)).await.unwrap();

    assert!(matches!(
        p.transfer(UserId(1), UserId(2), 11).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        p.transfer(UserId(1), UserId(1), 5).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        p.transfer(UserId(1), UserId(2), -5).await,
        Err(Error::Validation(_))
    ));

    assert_eq!(p.account(UserId(1)).await.unwrap().balance, 10);
    assert!(store.account_row(UserId(2)).is_none());
}

#[tokio::test]
async fn cache_writes_during_a_transaction_are_kept() {
    let (p, store) = service();
    let user = UserId(1);
    p.set_account(funded(1, 100, 0)).await.unwrap();
    p.flush().await.unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    let mut tx = p.begin().await.unwrap();
    let mut acc = tx.account(user).await.unwrap();
    assert!(matches!(
        p.claim_daily(user, 50, t0).await.unwrap(),
        Claim::Granted { .. }
    ));
    acc.balance -= 30;
    tx.put_account(acc).await.unwrap();
    assert!(matches!(tx.commit().await, Err(Error::Conflict(_))));

    let acc = p.account(user).await.unwrap();
    assert_eq!(acc.balance, 150);
    assert_eq!(acc.last_daily, Some(t0));
    p.flush().await.unwrap();
    assert_eq!(store.account_row(user).unwrap().balance, 150);

    let later = t0 + chrono::Duration::hours(1);
    assert!(matches!(
        p.claim_daily(user, 50, later).await.unwrap(),
        Claim::Cooldown { .. }
    ));

    // A fresh transaction builds on the claimed reward.
    let (a, b) = p.transfer(user, UserId(2), 30).await.unwrap();
    assert_eq!((a.balance, a.last_daily), (120, Some(t0)));
    assert_eq!(b.balance, 30);
}

#[tokio::test]
async fn dropped_transaction_rolls_back() {
    let (p, store) = service();
    {
        let mut tx = p.begin().await.unwrap();
        tx.put_account(funded(4, 99, 0)).await.unwrap();
    }
    assert!(store.account_row(UserId(4)).is_none());
    // The write lock was released.
    p.set_account(funded(4, 1, 0)).await.unwrap();
    p.flush().await.unwrap();
    assert_eq!(store.account_row(UserId(4)).unwrap().balance, 1);
}

#[tokio::test]
async fn daily_reward_once_per_day() {
    let (p, _) = service();
    let user = UserId(8);
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    let first = p.claim_daily(user, 100, t0).await.unwrap();
    assert!(matches!(first, Claim::Granted { ref account, .. } if account.balance == 100));

    let later = t0 + chrono::Duration::hours(23);
    match p.claim_daily(user, 100, later).await.unwrap() {
        Claim::Cooldown { remaining } => assert_eq!(remaining, Duration::from_secs(3600)),
        other => panic!("expected cooldown, got {other:?}"),
    }
    assert_eq!(p.account(user).await.unwrap().balance, 100);

    let next_day = t0 + chrono::Duration::hours(24);
    assert!(matches!(
        p.claim_daily(user, 100, next_day).await.unwrap(),
        Claim::Granted { .. }
    ));
    assert_eq!(p.account(user).await.unwrap().balance, 200);
}

#[tokio::test]
async fn work_streak_grows_within_grace() {
    let (p, _) = service();
    let user = UserId(3);
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

    let streak = |c: Claim| match c {
        Claim::Granted { streak, .. } => streak,
        Claim::Cooldown { .. } => 0,
    };

    assert_eq!(streak(p.claim_work(user, 10, t0).await.unwrap()), 1);
    let t1 = t0 + chrono::Duration::minutes(30);
    assert_eq!(streak(p.claim_work(user, 10, t1).await.unwrap()), 0);
    let t2 = t0 + chrono::Duration::minutes(90);
    assert_eq!(streak(p.claim_work(user, 10, t2).await.unwrap()), 2);
    let t3 = t2 + chrono::Duration::hours(5);
    assert_eq!(streak(p.claim_work(user, 10, t3).await.unwrap()), 1);
    assert_eq!(p.account(user).await.unwrap().balance, 30);
}

#[tokio::test]
async fn rewards_that_would_overflow_are_rejected() {
    let (p, _) = service();
    let user = UserId(12);
    p.set_account(funded(12, i64::MAX - 10, 0)).await.unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

    assert!(matches!(p.claim_daily(user, 100, t0).await, Err(Error::Validation(_))));
    assert!(matches!(p.claim_work(user, 100, t0).await, Err(Error::Validation(_))));
    let acc = p.account(user).await.unwrap();
    assert_eq!(acc.balance, i64::MAX - 10);
    assert_eq!(acc.last_daily, None);
    assert_eq!(acc.last_work, None);

    // Wallet fits but wallet plus bank does not.
    p.set_account(funded(12, 0, i64::MAX)).await.unwrap();
    assert!(matches!(p.claim_daily(user, 1, t0).await, Err(Error::Validation(_))));
    assert_eq!(p.account(user).await.unwrap().balance, 0);
}

#[tokio::test]
async fn violations_are_readable_after_record() {
    let (p, _) = service();
    let record = ViolationRecord {
        kind: ViolationKind::Invites,
        server_id: ServerId(1),
        user_id: UserId(2),
        channel_id: ChannelId(3),
        message_id: Some(MessageId(4)),
        timestamp: Utc::now(),
        details: "discord.gg/abc".into(),
    };
    p.record_violation(record.clone()).await.unwrap();
    p.record_violation(record.clone()).await.unwrap();

    let got = p
        .recent_violations(ServerId(1), Some(UserId(2)), 10)
        .await
        .unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].record, record);
}

#[tokio::test]
async fn store_reads_go_through_the_breaker() {
    let store = MemoryStore::new();
    let p = Persistence::new(
        Arc::new(store.clone()),
        PersistenceSettings {
            breaker: BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(60),
                success_threshold: 1,
            },
            ..settings()
        },
    );
    store.fail_reads(1);
    assert!(matches!(p.account(UserId(1)).await, Err(Error::Transient(_))));
    assert!(matches!(p.account(UserId(1)).await, Err(Error::CircuitOpen(_))));
}
