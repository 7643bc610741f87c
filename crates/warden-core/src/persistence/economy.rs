use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    domain::UserId,
    persistence::{model::EconomyAccount, Persistence},
    Error, Result,
};

pub const DAILY_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);
pub const WORK_COOLDOWN: Duration = Duration::from_secs(60 * 60);
/// A work claim within this long of the previous one extends the streak.
const WORK_STREAK_GRACE: Duration = Duration::from_secs(2 * 60 * 60);
const TRANSFER_ATTEMPTS: u32 = 3;

/// Result of a cooldown-gated reward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    Granted { account: EconomyAccount, streak: u32 },
    Cooldown { remaining: Duration },
}

fn elapsed_since(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    // A timestamp in the future (clock skew) counts as "just now".
    last.map(|t| (now - t).to_std().unwrap_or(Duration::ZERO))
}

fn credit(balance: i64, amount: i64) -> Result<i64> {
    balance
        .checked_add(amount)
        .ok_or_else(|| Error::validation("balance overflow"))
}

fn positive(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(Error::validation("amount must be positive"));
    }
    Ok(())
}

impl Persistence {
    pub async fn add_balance(&self, user: UserId, delta: i64) -> Result<EconomyAccount> {
        let (acc, ()) = self
            .update_account(user, |acc| {
                let next = credit(acc.balance, delta)?;
                if next < 0 {
                    return Err(Error::validation("insufficient funds"));
                }
                acc.balance = next;
                Ok(())
            })
            .await?;
        Ok(acc)
    }

    /// Move `amount` from wallet to bank.
    pub async fn deposit(&self, user: UserId, amount: i64) -> Result<EconomyAccount> {
        positive(amount)?;
        let (acc, ()) = self
            .update_account(user, |acc| {
                if acc.balance < amount {
                    return Err(Error::validation(format!(
                        "insufficient funds: wallet holds {}",
                        acc.balance
                    )));
                }
                acc.balance -= amount;
                acc.bank = credit(acc.bank, amount)?;
                Ok(())
            })
            .await?;
        Ok(acc)
    }

    /// Move `amount` from bank to wallet.
    pub async fn withdraw(&self, user: UserId, amount: i64) -> Result<EconomyAccount> {
        positive(amount)?;
        let (acc, ()) = self
            .update_account(user, |acc| {
                if acc.bank < amount {
                    return Err(Error::validation(format!(
                        "insufficient funds: bank holds {}",
                        acc.bank
                    )));
                }
                acc.bank -= amount;
                acc.balance = credit(acc.balance, amount)?;
                Ok(())
            })
            .await?;
        Ok(acc)
    }

    /// Wallet-to-wallet transfer inside one explicit transaction. The transaction is
    /// rerun when either account is written concurrently.
    pub async fn transfer(
        &self,
        from: UserId,
        to: UserId,
        amount: i64,
    ) -> Result<(EconomyAccount, EconomyAccount)> {
        if from == to {
            return Err(Error::validation("cannot transfer to yourself"));
        }
        positive(amount)?;

        let mut attempt = 1;
        loop {
            match self.try_transfer(from, to, amount).await {
                Err(Error::Conflict(reason)) if attempt < TRANSFER_ATTEMPTS => {
                    tracing::debug!(attempt, reason = %reason, "transfer conflicted, retrying");
                    attempt += 1;
                }
                Ok((sender, receiver)) => {
                    tracing::info!(from = %from, to = %to, amount, "transfer committed");
                    return Ok((sender, receiver));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_transfer(
        &self,
        from: UserId,
        to: UserId,
        amount: i64,
    ) -> Result<(EconomyAccount, EconomyAccount)> {
        let mut tx = self.begin().await?;
        let mut sender = tx.account(from).await?;
        if sender.balance < amount {
            tx.rollback().await?;
            return Err(Error::validation(format!(
                "insufficient funds: wallet holds {}",
                sender.balance
            )));
        }
        let mut receiver = tx.account(to).await?;
        sender.balance -= amount;
        receiver.balance = credit(receiver.balance, amount)?;
        if !receiver.total_fits() {
            return Err(Error::validation("balance overflow"));
        }

        sender.normalize();
        receiver.normalize();
        tx.put_account(sender.clone()).await?;
        tx.put_account(receiver.clone()).await?;
        tx.commit().await?;
        Ok((sender, receiver))
    }

    pub async fn claim_daily(&self, user: UserId, reward: i64, now: DateTime<Utc>) -> Result<Claim> {
        positive(reward)?;
        let (acc, claim) = self
            .update_account(user, |acc| {
                if let Some(elapsed) = elapsed_since(acc.last_daily, now) {
                    if elapsed < DAILY_COOLDOWN {
                        return Ok(Err(DAILY_COOLDOWN - elapsed));
                    }
                }
                acc.balance = credit(acc.balance, reward)?;
                acc.last_daily = Some(now);
                Ok(Ok(()))
            })
            .await?;
        Ok(match claim {
            Ok(()) => Claim::Granted {
                account: acc,
                streak: 1,
            },
            Err(remaining) => Claim::Cooldown { remaining },
        })
    }

    pub async fn claim_work(&self, user: UserId, reward: i64, now: DateTime<Utc>) -> Result<Claim> {
        positive(reward)?;
        let (acc, claim) = self
            .update_account(user, |acc| {
                let elapsed = elapsed_since(acc.last_work, now);
                if let Some(elapsed) = elapsed {
                    if elapsed < WORK_COOLDOWN {
                        return Ok(Err(WORK_COOLDOWN - elapsed));
                    }
                }
                acc.work_streak = match elapsed {
                    Some(e) if e <= WORK_STREAK_GRACE => acc.work_streak.saturating_add(1),
                    _ => 1,
                };
                acc.balance = credit(acc.balance, reward)?;
                acc.last_work = Some(now);
                Ok(Ok(acc.work_streak))
            })
            .await?;
        Ok(match claim {
            Ok(streak) => Claim::Granted {
                account: acc,
                streak,
            },
            Err(remaining) => Claim::Cooldown { remaining },
        })
    }
}
