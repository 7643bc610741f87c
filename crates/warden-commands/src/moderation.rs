use std::time::Duration;

use async_trait::async_trait;
use warden_core::{
    dispatcher::{Command, CommandContext, CommandDescriptor, CommandFlags},
    Result,
};

use crate::{parse_user, server_of};

const LISTED_VIOLATIONS: usize = 10;

fn moderator_flags() -> CommandFlags {
    CommandFlags {
        admin_only: true,
        server_only: true,
        ..CommandFlags::default()
    }
}

/// Recent automod violations for the server or one user.
pub struct Violations;

#[async_trait]
impl Command for Violations {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("violations")
            .aliases(["infractions"])
            .usage("violations [user id]")
            .description("List recent automod violations")
            .rate_limit(2, Duration::from_secs(10))
            .flags(moderator_flags())
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let server = server_of(ctx)?;
        let user = ctx.args.first().map(String::as_str).map(parse_user).transpose()?;
        let found = ctx
            .services
            .automod
            .recent_violations(server, user, LISTED_VIOLATIONS)
            .await?;

        if found.is_empty() {
            ctx.reply("No violations recorded").await?;
            return Ok(());
        }
        let mut lines = Vec::with_capacity(found.len() + 1);
        lines.push(format!("Last {} violations:", found.len()));
        for v in &found {
            let r = &v.record;
            lines.push(format!(
                "#{} {} user {} in {}: {} ({})",
                v.id,
                r.timestamp.format("%Y-%m-%d %H:%M"),
                r.user_id,
                r.channel_id,
                r.kind,
                r.details
            ));
        }
        ctx.reply(&lines.join("\n")).await?;
        Ok(())
    }
}

/// Current automod score of a user.
pub struct Score;

#[async_trait]
impl Command for Score {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("score")
            .usage("score <user id>")
            .description("Show a user's current automod score")
            .flags(moderator_flags())
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let server = server_of(ctx)?;
        let user = parse_user(ctx.arg(0, "user id")?)?;
        let text = match ctx.services.automod.user_score(server, user) {
            Some(score) => format!("User {user} has an automod score of {score:.1}"),
            None => format!("User {user} has no recent activity"),
        };
        ctx.reply(&text).await?;
        Ok(())
    }
}
