use async_trait::async_trait;
use warden_core::{
    dispatcher::{Command, CommandContext, CommandDescriptor, CommandFlags},
    Result,
};

/// Rebuild one command from its factory without restarting.
pub struct Reload;

#[async_trait]
impl Command for Reload {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("reload")
            .usage("reload <command>")
            .description("Reload a command definition")
            .flags(CommandFlags {
                owner_only: true,
                hidden: true,
                ..CommandFlags::default()
            })
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let name = ctx.arg(0, "command name")?;
        match ctx.dispatcher.reload(name) {
            Ok(d) => {
                ctx.reply(&format!("Reloaded {} ({})", d.name, d.category))
                    .await?;
            }
            Err(e) => {
                tracing::warn!(command = name, error = %e, "reload failed");
                ctx.reply(&format!("Reload of {name} failed: {e}")).await?;
            }
        }
        Ok(())
    }
}

/// Lists visible commands grouped by category.
pub struct Commands;

#[async_trait]
impl Command for Commands {
    fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor::new("commands")
            .aliases(["cmds"])
            .usage("commands")
            .description("List available commands")
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let mut out = String::new();
        let mut current = "";
        let listed = ctx.dispatcher.commands();
        for d in &listed {
            if d.category != current {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&format!("[{}]\n", d.category));
                current = &d.category;
            }
            out.push_str(&format!("{}{} - {}\n", ctx.prefix, d.usage, d.description));
        }
        ctx.reply(out.trim_end()).await?;
        Ok(())
    }
}
