use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    automod::AutoModerator,
    chat::{ChatMessage, ChatPort},
    dispatcher::Dispatcher,
    domain::{MessageRef, UserId},
    persistence::{model::ServerConfig, Persistence},
    Error, Result,
};

/// Fixed-window limit applied per (user, command).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_uses: u32,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_uses: 1,
            window: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// Bot owners and server owners only.
    pub owner_only: bool,
    /// Server administrators (and owners).
    pub admin_only: bool,
    /// Rejected in direct messages.
    pub server_only: bool,
    /// Left out of command listings.
    pub hidden: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub name: String,
    /// Filled in from the manifest category at registration.
    pub category: String,
    pub aliases: Vec<String>,
    pub usage: String,
    pub description: String,
    pub rate_limit: RateLimitPolicy,
    pub flags: CommandFlags,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
            aliases: Vec::new(),
            usage: String::new(),
            description: String::new(),
            rate_limit: RateLimitPolicy::default(),
            flags: CommandFlags::default(),
        }
    }

    pub fn aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn rate_limit(mut self, max_uses: u32, window: Duration) -> Self {
        self.rate_limit = RateLimitPolicy { max_uses, window };
        self
    }

    pub fn flags(mut self, flags: CommandFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Shape checks that do not need the registry.
    pub fn validate(&self) -> Result<()> {
        fn key_ok(key: &str) -> bool {
            !key.is_empty()
                && !key.chars().any(char::is_whitespace)
                && key.to_lowercase() == key
        }

        if !key_ok(&self.name) {
            return Err(Error::validation(format!(
                "command name {:?} must be non-empty lowercase without whitespace",
                self.name
            )));
        }
        for alias in &self.aliases {
            if !key_ok(alias) {
                return Err(Error::validation(format!(
                    "alias {alias:?} of {} must be non-empty lowercase without whitespace",
                    self.name
                )));
            }
            if *alias == self.name {
                return Err(Error::validation(format!("{} aliases itself", self.name)));
            }
        }
        if self.rate_limit.max_uses == 0 || self.rate_limit.window.is_zero() {
            return Err(Error::validation(format!(
                "{} has an empty rate-limit policy",
                self.name
            )));
        }
        Ok(())
    }
}

/// A command body. Bodies get everything they need from [`CommandContext`].
#[async_trait]
pub trait Command: Send + Sync {
    fn descriptor(&self) -> CommandDescriptor;

    async fn execute(&self, ctx: &CommandContext) -> Result<()>;
}

/// Builds a fresh command instance; called at load and again on reload.
pub type CommandFactory = Arc<dyn Fn() -> Result<Arc<dyn Command>> + Send + Sync>;

pub fn factory<F>(f: F) -> CommandFactory
where
    F: Fn() -> Result<Arc<dyn Command>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One named group of command factories in the manifest.
#[async_trait]
pub trait CommandCategory: Send + Sync {
    fn name(&self) -> &str;

    /// Listing failure aborts the whole load.
    async fn entries(&self) -> Result<Vec<CommandFactory>>;
}

/// A category whose entries are known at compile time.
pub struct StaticCategory {
    name: String,
    entries: Vec<CommandFactory>,
}

impl StaticCategory {
    pub fn new(name: impl Into<String>, entries: Vec<CommandFactory>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }
}

#[async_trait]
impl CommandCategory for StaticCategory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn entries(&self) -> Result<Vec<CommandFactory>> {
        Ok(self.entries.clone())
    }
}

pub type Manifest = Vec<Arc<dyn CommandCategory>>;

/// Shared services handed to every command invocation.
#[derive(Clone)]
pub struct Services {
    pub persistence: Persistence,
    pub chat: Arc<dyn ChatPort>,
    pub automod: AutoModerator,
    /// Bot-wide owners (from configuration).
    pub owners: Vec<UserId>,
}

/// Everything a command body sees. Owned, so bodies can run on their own task.
#[derive(Clone)]
pub struct CommandContext {
    pub message: ChatMessage,
    /// The token the user typed, lowercased (may be an alias).
    pub invoked_as: String,
    pub args: Vec<String>,
    pub prefix: String,
    pub config: ServerConfig,
    pub services: Services,
    pub dispatcher: Dispatcher,
}

impl CommandContext {
    pub async fn reply(&self, text: &str) -> Result<MessageRef> {
        self.services
            .chat
            .send_message(self.message.channel_id, text)
            .await
    }

    pub fn author(&self) -> UserId {
        self.message.author.id
    }

    pub fn is_owner(&self) -> bool {
        let user = self.author();
        self.services.owners.contains(&user) || self.config.is_owner(user)
    }

    pub fn is_admin(&self) -> bool {
        self.message.author.is_admin || self.is_owner()
    }

    /// Positional argument `i`, or a validation error naming `what`.
    pub fn arg(&self, i: usize, what: &str) -> Result<&str> {
        self.args
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| Error::validation(format!("missing {what}")))
    }
}
