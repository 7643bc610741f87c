use std::time::Duration;

use async_trait::async_trait;
use warden_core::{
    dispatcher::{Command, CommandContext, CommandDescriptor, CommandFlags},
    domain::ChannelId,
    persistence::model::AutomodConfig,
    Error, Result,
};

use crate::{on_off, parse_switch, server_of};

const MAX_PREFIX_LEN: usize = 5;

fn admin_flags() -> CommandFlags {
    CommandFlags {
        admin_only: true,
        server_only: true,
        ..CommandFlags::default()
    }
}

/// Show or change the server's command prefix.
pub struct Prefix;

#[async_trait]
impl Command for Prefix {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("prefix")
            .usage("prefix [new prefix]")
            .description("Show or change the command prefix")
            .rate_limit(1, Duration::from_secs(5))
            .flags(admin_flags())
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let Some(new) = ctx.args.first() else {
            ctx.reply(&format!("Current prefix: {}", ctx.config.prefix))
                .await?;
            return Ok(());
        };
        if new.chars().count() > MAX_PREFIX_LEN {
            return Err(Error::validation(format!(
                "prefix must be at most {MAX_PREFIX_LEN} characters"
            )));
        }

        let server = server_of(ctx)?;
        let new = new.clone();
        let (_, old) = ctx
            .services
            .persistence
            .update_server_config(server, |cfg| Ok(std::mem::replace(&mut cfg.prefix, new)))
            .await?;
        tracing::info!(server = %server, old = %old, new = %ctx.args[0], "prefix changed");
        ctx.reply(&format!("Prefix changed from {old} to {}", ctx.args[0]))
            .await?;
        Ok(())
    }
}

/// Automoderation switches: `automod [on|off]`, `automod <filter> <on|off>`,
/// `automod log <channel|off>`.
pub struct Automod;

fn set_filter(am: &mut AutomodConfig, filter: &str, on: bool) -> Result<&'static str> {
    Ok(match filter {
        "spam" => {
            am.spam.enabled = on;
            "spam"
        }
        "repeat" | "rapid_repeat" => {
            am.spam.rapid_repeat = on;
            "rapid repeat"
        }
        "mentions" => {
            am.mentions.enabled = on;
            "mentions"
        }
        "caps" => {
            am.caps.enabled = on;
            "caps"
        }
        "links" => {
            am.links.enabled = on;
            "links"
        }
        "invites" => {
            am.invites.enabled = on;
            "invites"
        }
        other => return Err(Error::validation(format!("unknown filter {other:?}"))),
    })
}

fn status(am: &AutomodConfig) -> String {
    let log = am
        .log_channel
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string());
    format!(
        "Automod: {}\nspam: {} ({} msgs / {}s, repeat {})\nmentions: {} (max {})\ncaps: {} ({:.0}%)\nlinks: {}\ninvites: {}\nlog channel: {log}",
        on_off(am.enabled),
        on_off(am.spam.enabled),
        am.spam.threshold,
        am.spam.window_secs,
        on_off(am.spam.rapid_repeat),
        on_off(am.mentions.enabled),
        am.mentions.max_mentions,
        on_off(am.caps.enabled),
        am.caps.max_ratio * 100.0,
        on_off(am.links.enabled),
        on_off(am.invites.enabled),
    )
}

#[async_trait]
impl Command for Automod {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("automod")
            .aliases(["am"])
            .usage("automod [on|off | <filter> <on|off> | log <channel|off>]")
            .description("Configure automatic moderation")
            .rate_limit(3, Duration::from_secs(10))
            .flags(admin_flags())
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let server = server_of(ctx)?;
        let args: Vec<String> = ctx.args.iter().map(|a| a.to_ascii_lowercase()).collect();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let persistence = &ctx.services.persistence;
        let reply = match args.as_slice() {
            [] => status(&ctx.config.automod),
            ["on" | "off" | "enable" | "disable" | "true" | "false" | "yes" | "no"] => {
                let on = parse_switch(args[0])?;
                persistence
                    .update_server_config(server, |cfg| {
                        cfg.automod.enabled = on;
                        cfg.features.automod = on;
                        Ok(())
                    })
                    .await?;
                format!("Automod is now {}", on_off(on))
            }
            ["log", target] => {
                let channel = match *target {
                    "off" | "none" => None,
                    raw => Some(ChannelId(raw.parse::<i64>().map_err(|_| {
                        Error::validation(format!("{raw:?} is not a channel id"))
                    })?)),
                };
                persistence
                    .update_server_config(server, |cfg| {
                        cfg.automod.log_channel = channel;
                        Ok(())
                    })
                    .await?;
                match channel {
                    Some(c) => format!("Automod log channel set to {c}"),
                    None => "Automod log channel cleared".to_string(),
                }
            }
            [filter, switch] => {
                let on = parse_switch(switch)?;
                let (_, label) = persistence
                    .update_server_config(server, |cfg| set_filter(&mut cfg.automod, filter, on))
                    .await?;
                format!("Automod {label} filter is now {}", on_off(on))
            }
            _ => return Err(Error::validation("unrecognized automod arguments")),
        };
        ctx.reply(&reply).await?;
        Ok(())
    }
}

/// `disable <command>` / `enable <command>` for this server.
pub struct Toggle {
    pub enable: bool,
}

#[async_trait]
impl Command for Toggle {
    fn descriptor(&self) -> CommandDescriptor {
        let (name, verb) = if self.enable {
            ("enable", "Re-enable")
        } else {
            ("disable", "Disable")
        };
        CommandDescriptor::new(name)
            .usage(format!("{name} <command>"))
            .description(format!("{verb} a command in this server"))
            .flags(admin_flags())
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let server = server_of(ctx)?;
        let wanted = ctx.arg(0, "command name")?;
        let Some((_, target)) = ctx.dispatcher.resolve(wanted) else {
            return Err(Error::validation(format!("unknown command {wanted:?}")));
        };
        if matches!(target.name.as_str(), "enable" | "disable") {
            return Err(Error::validation(format!("{} cannot be disabled", target.name)));
        }

        let enable = self.enable;
        let name = target.name.clone();
        let (_, changed) = ctx
            .services
            .persistence
            .update_server_config(server, |cfg| {
                let list = &mut cfg.security.disabled_commands;
                let present = list.iter().any(|c| c.eq_ignore_ascii_case(&name));
                Ok(match (enable, present) {
                    (true, true) => {
                        list.retain(|c| !c.eq_ignore_ascii_case(&name));
                        true
                    }
                    (false, false) => {
                        list.push(name.clone());
                        true
                    }
                    _ => false,
                })
            })
            .await?;

        let state = if enable { "enabled" } else { "disabled" };
        let reply = if changed {
            format!("{} is now {state}", target.name)
        } else {
            format!("{} was already {state}", target.name)
        };
        ctx.reply(&reply).await?;
        Ok(())
    }
}
