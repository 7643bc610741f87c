use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use warden_core::{
    dispatcher::{Command, CommandContext, CommandDescriptor, CommandFlags},
    persistence::{Claim, EconomyAccount},
    Error, Result,
};

use crate::{format_duration, parse_amount, parse_user, Amount};

fn require_economy(ctx: &CommandContext) -> Result<()> {
    if ctx.message.server_id.is_some() && !ctx.config.features.economy {
        return Err(Error::validation("the economy is disabled in this server"));
    }
    Ok(())
}

fn summary(acc: &EconomyAccount) -> String {
    format!(
        "Wallet: {} | Bank: {} | Total: {}",
        acc.balance, acc.bank, acc.total
    )
}

pub struct Balance;

#[async_trait]
impl Command for Balance {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("balance")
            .aliases(["bal", "wallet"])
            .usage("balance [user id]")
            .description("Show a wallet and bank balance")
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        require_economy(ctx)?;
        let user = match ctx.args.first() {
            Some(raw) => parse_user(raw)?,
            None => ctx.author(),
        };
        let acc = ctx.services.persistence.account(user).await?;
        let text = if user == ctx.author() {
            summary(&acc)
        } else {
            format!("{user}: {}", summary(&acc))
        };
        ctx.reply(&text).await?;
        Ok(())
    }
}

fn claimed(claim: Claim, what: &str, reward: i64) -> String {
    match claim {
        Claim::Granted { account, streak } if streak > 1 => format!(
            "You earned {reward} from your {what} (streak {streak}). {}",
            summary(&account)
        ),
        Claim::Granted { account, .. } => {
            format!("You earned {reward} from your {what}. {}", summary(&account))
        }
        Claim::Cooldown { remaining } => format!(
            "Your {what} is not ready yet, try again in {}",
            format_duration(remaining)
        ),
    }
}

pub struct Daily {
    pub reward: i64,
}

#[async_trait]
impl Command for Daily {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("daily")
            .usage("daily")
            .description("Claim the daily reward")
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        require_economy(ctx)?;
        let claim = ctx
            .services
            .persistence
            .claim_daily(ctx.author(), self.reward, Utc::now())
            .await?;
        ctx.reply(&claimed(claim, "daily reward", self.reward))
            .await?;
        Ok(())
    }
}

pub struct Work {
    pub reward: i64,
}

#[async_trait]
impl Command for Work {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("work")
            .usage("work")
            .description("Work a shift; consecutive shifts build a streak")
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        require_economy(ctx)?;
        let claim = ctx
            .services
            .persistence
            .claim_work(ctx.author(), self.reward, Utc::now())
            .await?;
        ctx.reply(&claimed(claim, "shift", self.reward)).await?;
        Ok(())
    }
}

/// `deposit` (wallet to bank) and `withdraw` (bank to wallet).
pub struct Bank {
    pub deposit: bool,
}

#[async_trait]
impl Command for Bank {
    fn descriptor(&self) -> CommandDescriptor {
        if self.deposit {
            CommandDescriptor::new("deposit")
                .aliases(["dep"])
                .usage("deposit <amount|all>")
                .description("Move money from your wallet to the bank")
        } else {
            CommandDescriptor::new("withdraw")
                .aliases(["with"])
                .usage("withdraw <amount|all>")
                .description("Move money from the bank to your wallet")
        }
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        require_economy(ctx)?;
        let user = ctx.author();
        let persistence = &ctx.services.persistence;
        let amount = match parse_amount(ctx.arg(0, "amount")?)? {
            Amount::Exact(n) => n,
            Amount::All => {
                let acc = persistence.account(user).await?;
                let available = if self.deposit { acc.balance } else { acc.bank };
                if available <= 0 {
                    return Err(Error::validation("nothing to move"));
                }
                available
            }
        };

        let acc = if self.deposit {
            persistence.deposit(user, amount).await?
        } else {
            persistence.withdraw(user, amount).await?
        };
        let verb = if self.deposit { "Deposited" } else { "Withdrew" };
        ctx.reply(&format!("{verb} {amount}. {}", summary(&acc)))
            .await?;
        Ok(())
    }
}

pub struct Pay;

#[async_trait]
impl Command for Pay {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("pay")
            .aliases(["give"])
            .usage("pay <user id> <amount>")
            .description("Send money from your wallet to another user")
            .rate_limit(2, Duration::from_secs(10))
            .flags(CommandFlags {
                server_only: true,
                ..CommandFlags::default()
            })
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        require_economy(ctx)?;
        let to = parse_user(ctx.arg(0, "recipient")?)?;
        let Amount::Exact(amount) = parse_amount(ctx.arg(1, "amount")?)? else {
            return Err(Error::validation("pay needs an exact amount"));
        };
        let (sender, _) = ctx
            .services
            .persistence
            .transfer(ctx.author(), to, amount)
            .await?;
        ctx.reply(&format!("Sent {amount} to {to}. {}", summary(&sender)))
            .await?;
        Ok(())
    }
}
