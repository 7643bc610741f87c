//! The single event loop: security lists, automod, then dispatch.
//!
//! Everything that must happen in arrival order (automod windows, rate-limit
//! transitions) runs inline; command bodies and moderation actions run on their own
//! tasks.

use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    chat::{ChatEvent, ChatMessage},
    dispatcher::{Dispatcher, Forbidden, Prepared, Services},
    domain::{ChannelId, ServerId, UserId},
    persistence::model::ServerConfig,
    Error, Result,
};

pub struct Runtime {
    dispatcher: Dispatcher,
    services: Services,
    bot_user: Option<UserId>,
    tasks: JoinSet<()>,
}

impl Runtime {
    pub fn new(dispatcher: Dispatcher, services: Services) -> Self {
        Self {
            dispatcher,
            services,
            bot_user: None,
            tasks: JoinSet::new(),
        }
    }

    /// Consume events until the channel closes or `cancel` fires, then wait for
    /// in-flight command bodies.
    pub async fn run(mut self, mut events: mpsc::Receiver<ChatEvent>, cancel: CancellationToken) -> Result<()> {
        tracing::info!(commands = self.dispatcher.len(), "runtime started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = res {
                        tracing::error!(error = %e, "handler task panicked");
                    }
                }
                ev = events.recv() => match ev {
                    Some(ev) => self.handle(ev).await,
                    None => break,
                },
            }
        }

        let in_flight = self.tasks.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "waiting for running handlers");
        }
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "handler task panicked");
            }
        }
        tracing::info!("runtime stopped");
        Ok(())
    }

    pub async fn handle(&mut self, ev: ChatEvent) {
        match ev {
            ChatEvent::MessageCreated(msg) => self.on_message(msg).await,
            ChatEvent::ServerJoined { server_id, name } => {
                tracing::info!(server = %server_id, name = name.as_deref().unwrap_or(""), "joined server");
                if let Err(e) = self.services.persistence.server_config(server_id).await {
                    tracing::warn!(server = %server_id, error = %e, "could not load config for new server");
                }
            }
            ChatEvent::ServerLeft { server_id } => {
                tracing::info!(server = %server_id, "left server");
                self.services.automod.forget_server(server_id);
                if let Err(e) = self.services.persistence.forget_server(server_id).await {
                    tracing::warn!(server = %server_id, error = %e, "could not flush config of departed server");
                }
            }
            ChatEvent::ChannelCreated { server_id, channel_id } => {
                tracing::debug!(server = %server_id, channel = %channel_id, "channel created");
            }
            ChatEvent::ChannelDeleted { server_id, channel_id } => {
                self.on_channel_deleted(server_id, channel_id).await;
            }
            ChatEvent::Ready { bot_user } => {
                self.bot_user = bot_user;
                tracing::info!(bot_user = ?bot_user.map(|u| u.0), "chat connection ready");
            }
            ChatEvent::Reconnected => tracing::info!("chat connection resumed"),
        }
    }

    async fn on_message(&mut self, msg: ChatMessage) {
        if msg.author.is_bot || Some(msg.author.id) == self.bot_user {
            return;
        }

        let cfg = match msg.server_id {
            Some(server) => match self.services.persistence.server_config(server).await {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "config unavailable, ignoring message");
                    return;
                }
            },
            None => self.services.persistence.defaults().clone(),
        };

        if msg.server_id.is_some() && !self.passes_security(&msg, &cfg) {
            return;
        }

        let verdict = self.services.automod.evaluate(&msg, &cfg, Instant::now());
        if !verdict.is_clean() {
            let automod = self.services.automod.clone();
            let cfg = cfg.clone();
            self.tasks.spawn(async move {
                automod.enforce(&msg, &cfg, &verdict).await;
            });
            return;
        }

        let prefix = cfg.prefix.clone();
        match self.dispatcher.prepare(&msg, &prefix, &cfg, &self.services) {
            Prepared::NotACommand | Prepared::Unknown { .. } => {}
            Prepared::Forbidden { command, reason } => {
                tracing::debug!(command = %command, user = %msg.author.id, ?reason, "command forbidden");
                self.reply_later(msg.channel_id, forbidden_text(&command, reason));
            }
            Prepared::RateLimited { command, remaining } => {
                self.reply_later(msg.channel_id, rate_limited_text(&command, remaining));
            }
            Prepared::Ready(inv) => {
                let chat = self.services.chat.clone();
                let channel = msg.channel_id;
                let usage = inv.descriptor().usage.clone();
                let name = inv.name().to_string();
                self.tasks.spawn(async move {
                    let text = match inv.run().await {
                        Ok(()) => return,
                        Err(Error::Validation(reason)) if usage.is_empty() => reason,
                        Err(Error::Validation(reason)) => format!("{reason}\nUsage: {prefix}{usage}"),
                        Err(Error::Permission(_)) => {
                            format!("I don't have permission to do that ({name}).")
                        }
                        Err(_) => format!("Something went wrong running {name}."),
                    };
                    if let Err(e) = chat.send_message(channel, &text).await {
                        tracing::warn!(error = %e, "could not send error reply");
                    }
                });
            }
        }
    }

    /// Blocked users and disabled channels. Admins and owners bypass disabled channels.
    fn passes_security(&self, msg: &ChatMessage, cfg: &ServerConfig) -> bool {
        let sec = &cfg.security;
        let user = msg.author.id;
        if sec.blocked_users.contains(&user) {
            tracing::debug!(user = %user, "message from blocked user ignored");
            return false;
        }
        let privileged =
            msg.author.is_admin || cfg.is_owner(user) || self.services.owners.contains(&user);
        if sec.disabled_channels.contains(&msg.channel_id) && !privileged {
            return false;
        }
        true
    }

    async fn on_channel_deleted(&self, server: ServerId, channel: ChannelId) {
        let res = self
            .services
            .persistence
            .update_server_config(server, |cfg| {
                cfg.security.disabled_channels.retain(|c| *c != channel);
                cfg.automod.whitelist.channels.retain(|c| *c != channel);
                if cfg.automod.log_channel == Some(channel) {
                    cfg.automod.log_channel = None;
                }
                Ok(())
            })
            .await;
        if let Err(e) = res {
            tracing::warn!(server = %server, channel = %channel, error = %e, "could not clean up deleted channel");
        }
    }

    fn reply_later(&mut self, channel: ChannelId, text: String) {
        let chat = self.services.chat.clone();
        self.tasks.spawn(async move {
            if let Err(e) = chat.send_message(channel, &text).await {
                tracing::warn!(error = %e, "could not send reply");
            }
        });
    }
}

fn forbidden_text(command: &str, reason: Forbidden) -> String {
    match reason {
        Forbidden::OwnerOnly => format!("`{command}` is restricted to owners."),
        Forbidden::AdminOnly => format!("`{command}` requires administrator rights."),
        Forbidden::ServerOnly => format!("`{command}` only works in a server."),
        Forbidden::Disabled => format!("`{command}` is disabled here."),
    }
}

fn rate_limited_text(command: &str, remaining: Duration) -> String {
    format!(
        "Slow down! You can use `{command}` again in {:.1}s.",
        remaining.as_secs_f64()
    )
}

/// Run a [`Runtime`] on a fresh channel; returns the sender half.
pub fn spawn(
    runtime: Runtime,
    capacity: usize,
    cancel: CancellationToken,
) -> (mpsc::Sender<ChatEvent>, tokio::task::JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(runtime.run(rx, cancel));
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        automod::AutoModerator,
        chat::Author,
        dispatcher::{factory, Command, CommandContext, CommandDescriptor, Manifest, StaticCategory},
        domain::MessageId,
        persistence::{MemoryStore, Persistence, PersistenceSettings},
        testing::{message, FakeChat},
    };
    use async_trait::async_trait;

    struct Ping;

    #[async_trait]
    impl Command for Ping {
        fn descriptor(&self) -> CommandDescriptor {
            CommandDescriptor::new("ping").usage("ping <word>")
        }

        async fn execute(&self, ctx: &CommandContext) -> Result<()> {
            let word = ctx.arg(0, "word")?;
            ctx.reply(&format!("pong {word}")).await?;
            Ok(())
        }
    }

    struct Setup {
        tx: mpsc::Sender<ChatEvent>,
        handle: tokio::task::JoinHandle<Result<()>>,
        chat: Arc<FakeChat>,
        persistence: Persistence,
    }

    async fn setup() -> Setup {
        let chat = Arc::new(FakeChat::default());
        let persistence = Persistence::new(Arc::new(MemoryStore::new()), PersistenceSettings::default());
        let automod = AutoModerator::new(persistence.clone(), chat.clone(), Duration::from_secs(600)).unwrap();
        let services = Services {
            persistence: persistence.clone(),
            chat: chat.clone(),
            automod,
            owners: Vec::new(),
        };
        let dispatcher = Dispatcher::new(Duration::from_secs(30));
        let manifest: Manifest = vec![Arc::new(StaticCategory::new(
            "general",
            vec![factory(|| Ok(Arc::new(Ping) as Arc<dyn Command>))],
        ))];
        dispatcher.load(&manifest).await.unwrap();

        let (tx, handle) = spawn(Runtime::new(dispatcher, services), 16, CancellationToken::new());
        Setup {
            tx,
            handle,
            chat,
            persistence,
        }
    }

    async fn finish(s: Setup) -> Arc<FakeChat> {
        drop(s.tx);
        s.handle.await.unwrap().unwrap();
        s.chat
    }

    fn send(content: &str, user: i64) -> ChatEvent {
        ChatEvent::MessageCreated(message(1, 1, user, content))
    }

    #[tokio::test]
    async fn dispatches_and_replies() {
        let s = setup().await;
        s.tx.send(send("!ping hi", 1)).await.unwrap();
        s.tx.send(send("just chatting", 2)).await.unwrap();
        let chat = finish(s).await;
        assert_eq!(chat.sent_texts(), vec!["pong hi".to_string()]);
    }

    #[tokio::test]
    async fn validation_errors_are_answered_with_usage() {
        let s = setup().await;
        s.tx.send(send("!ping", 1)).await.unwrap();
        let chat = finish(s).await;
        assert_eq!(chat.sent_texts(), vec!["missing word\nUsage: !ping <word>".to_string()]);
    }

    #[tokio::test]
    async fn second_call_inside_window_is_rate_limited() {
        let s = setup().await;
        s.tx.send(send("!ping a", 1)).await.unwrap();
        s.tx.send(send("!ping b", 1)).await.unwrap();
        let chat = finish(s).await;
        let texts = chat.sent_texts();
        assert_eq!(texts.len(), 2);
        assert!(texts.contains(&"pong a".to_string()));
        assert!(texts.iter().any(|t| t.starts_with("Slow down!")));
    }

    #[tokio::test]
    async fn blocked_users_and_bots_are_ignored() {
        let s = setup().await;
        s.persistence
            .update_server_config(ServerId(1), |cfg| {
                cfg.security.blocked_users.push(UserId(5));
                cfg.prefix = "?".into();
                Ok(())
            })
            .await
            .unwrap();

        s.tx.send(send("?ping a", 5)).await.unwrap();
        let mut bot = message(1, 1, 6, "?ping b");
        bot.author = Author {
            is_bot: true,
            ..bot.author
        };
        s.tx.send(ChatEvent::MessageCreated(bot)).await.unwrap();
        s.tx.send(send("!ping c", 7)).await.unwrap();
        s.tx.send(send("?ping d", 7)).await.unwrap();
        let chat = finish(s).await;
        assert_eq!(chat.sent_texts(), vec!["pong d".to_string()]);
    }

    #[tokio::test]
    async fn flagged_messages_are_not_dispatched() {
        let s = setup().await;
        s.persistence
            .update_server_config(ServerId(1), |cfg| {
                cfg.automod.enabled = true;
                cfg.automod.actions.warn = false;
                Ok(())
            })
            .await
            .unwrap();

        let mut msg = message(1, 1, 3, "!ping EVERYONE LOOK AT THIS");
        msg.id = MessageId(77);
        s.tx.send(ChatEvent::MessageCreated(msg.clone())).await.unwrap();
        let chat = finish(s).await;
        assert!(chat.sent_texts().is_empty());
        assert_eq!(chat.deleted(), vec![msg.reference()]);
    }

    #[tokio::test]
    async fn deleted_channels_are_removed_from_config() {
        let s = setup().await;
        s.persistence
            .update_server_config(ServerId(1), |cfg| {
                cfg.security.disabled_channels.push(ChannelId(9));
                cfg.automod.log_channel = Some(ChannelId(9));
                Ok(())
            })
            .await
            .unwrap();
        s.tx.send(ChatEvent::ChannelDeleted {
            server_id: ServerId(1),
            channel_id: ChannelId(9),
        })
        .await
        .unwrap();
        let persistence = s.persistence.clone();
        finish(s).await;

        let cfg = persistence.server_config(ServerId(1)).await.unwrap();
        assert!(cfg.security.disabled_channels.is_empty());
        assert_eq!(cfg.automod.log_channel, None);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let s = setup().await;
        let cancel = CancellationToken::new();
        let chat = Arc::new(FakeChat::default());
        let persistence = s.persistence.clone();
        let automod = AutoModerator::new(persistence.clone(), chat.clone(), Duration::from_secs(1)).unwrap();
        let runtime = Runtime::new(
            Dispatcher::new(Duration::from_secs(1)),
            Services {
                persistence,
                chat,
                automod,
                owners: Vec::new(),
            },
        );
        let (_tx, handle) = spawn(runtime, 4, cancel.clone());
        cancel.cancel();
        handle.await.unwrap().unwrap();
        finish(s).await;
    }
}
