//! Built-in commands shipped with the bot.
//!
//! [`manifest`] groups them into categories for the dispatcher. Each entry is a
//! factory, so the dispatcher can rebuild a command on `reload`.

use std::{sync::Arc, time::Duration};

use warden_core::{
    dispatcher::{factory, Command, CommandContext, CommandFactory, Manifest, StaticCategory},
    domain::{ServerId, UserId},
    Error, Result,
};

mod admin;
mod config;
mod economy;
mod moderation;


/// Reward amounts for the cooldown-gated economy commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rewards {
    pub daily: i64,
    pub work: i64,
}

impl Default for Rewards {
    fn default() -> Self {
        Self {
            daily: 100,
            work: 25,
        }
    }
}

pub fn manifest(rewards: Rewards) -> Manifest {
    vec![
        Arc::new(StaticCategory::new(
            "config",
            vec![
                entry(|| config::Prefix),
                entry(|| config::Automod),
                entry(|| config::Toggle { enable: false }),
                entry(|| config::Toggle { enable: true }),
            ],
        )),
        Arc::new(StaticCategory::new(
            "moderation",
            vec![entry(|| moderation::Violations), entry(|| moderation::Score)],
        )),
        Arc::new(StaticCategory::new(
            "economy",
            vec![
                entry(|| economy::Balance),
                entry(move || economy::Daily {
                    reward: rewards.daily,
                }),
                entry(move || economy::Work {
                    reward: rewards.work,
                }),
                entry(|| economy::Bank { deposit: true }),
                entry(|| economy::Bank { deposit: false }),
                entry(|| economy::Pay),
            ],
        )),
        Arc::new(StaticCategory::new(
            "admin",
            vec![entry(|| admin::Reload), entry(|| admin::Commands)],
        )),
    ]
}

fn entry<C, F>(build: F) -> CommandFactory
where
    C: Command + 'static,
    F: Fn() -> C + Send + Sync + 'static,
{
    factory(move || Ok(Arc::new(build()) as Arc<dyn Command>))
}

// ============== Argument helpers ==============

fn server_of(ctx: &CommandContext) -> Result<ServerId> {
    ctx.message
        .server_id
        .ok_or_else(|| Error::validation("this command only works in a server"))
}

/// A numeric user id, optionally written as `@123`.
fn parse_user(raw: &str) -> Result<UserId> {
    raw.trim_start_matches('@')
        .parse::<i64>()
        .map(UserId)
        .map_err(|_| Error::validation(format!("{raw:?} is not a user id")))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Amount {
    All,
    Exact(i64),
}

fn parse_amount(raw: &str) -> Result<Amount> {
    if raw.eq_ignore_ascii_case("all") {
        return Ok(Amount::All);
    }
    match raw.replace(',', "").parse::<i64>() {
        Ok(n) if n > 0 => Ok(Amount::Exact(n)),
        _ => Err(Error::validation(format!("{raw:?} is not a positive amount"))),
    }
}

fn parse_switch(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "enable" | "true" | "yes" => Ok(true),
        "off" | "disable" | "false" | "no" => Ok(false),
        _ => Err(Error::validation(format!("expected on or off, got {raw:?}"))),
    }
}

fn on_off(b: bool) -> &'static str {
    if b {
        "on"
    } else {
        "off"
    }
}

fn format_duration(d: Duration) -> String {
    let seconds = d.as_secs();
    let hours = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        return format!("{hours}h {mins}m");
    }
    if mins > 0 {
        return format!("{mins}m {secs}s");
    }
    format!("{secs}s")
}

#[cfg(test)]
mod helper_tests {
    use super::*;

    #[test]
    fn parses_arguments() {
        assert_eq!(parse_user("@42").unwrap(), UserId(42));
        assert!(matches!(parse_user("bob"), Err(Error::Validation(_))));
        assert_eq!(parse_amount("ALL").unwrap(), Amount::All);
        assert_eq!(parse_amount("1,500").unwrap(), Amount::Exact(1500));
        assert!(parse_amount("0").is_err());
        assert!(parse_amount("-5").is_err());
        assert!(parse_switch("On").unwrap());
        assert!(!parse_switch("disable").unwrap());
        assert!(parse_switch("maybe").is_err());
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 60)), "3h 1m");
    }
}
