//! Telegram adapter (teloxide).
//!
//! [`TelegramChat`] implements the warden [`ChatPort`] over the Bot API, and
//! [`router::run_polling`] turns incoming updates into [`warden_core::chat::ChatEvent`]s.
//! A group chat is a server and also its only channel.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use teloxide::{prelude::*, types::ChatPermissions, ApiError, RequestError};

use warden_core::{
    chat::{ChannelInfo, ChatPort, MemberInfo},
    domain::{ChannelId, MessageId, MessageRef, ServerId, UserId},
    Error, Result,
};

pub mod convert;
pub mod router;

/// Bot API limit on message text, in characters.
pub const MAX_MESSAGE_LEN: usize = 4096;

// Telegram treats restrictions shorter than 30 seconds as permanent.
const MIN_RESTRICTION: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct TelegramChat {
    bot: Bot,
}

impl TelegramChat {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }
}

fn tg_chat(id: i64) -> teloxide::types::ChatId {
    teloxide::types::ChatId(id)
}

fn tg_user(user: UserId) -> Result<teloxide::types::UserId> {
    u64::try_from(user.0)
        .map(teloxide::types::UserId)
        .map_err(|_| Error::validation(format!("{user} is not a telegram user id")))
}

fn tg_msg(id: MessageId) -> Result<teloxide::types::MessageId> {
    i32::try_from(id.0)
        .map(teloxide::types::MessageId)
        .map_err(|_| Error::validation(format!("{} is not a telegram message id", id.0)))
}

/// Truncate to the Bot API limit on a character boundary.
fn fit(text: &str) -> String {
    match text.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

/// Map a Bot API failure onto the runtime error taxonomy.
pub fn map_err(e: RequestError) -> Error {
    match e {
        RequestError::RetryAfter(after) => Error::RateLimited {
            retry_after: Some(after),
            message: "telegram flood control".to_string(),
        },
        RequestError::Network(err) => Error::Transient(format!("telegram network: {err}")),
        RequestError::Io(err) => Error::Transient(format!("telegram io: {err}")),
        RequestError::Api(ApiError::BotBlocked | ApiError::BotKicked) => {
            Error::Permission("bot was blocked or removed from the chat".to_string())
        }
        RequestError::Api(api) => classify_api(&api.to_string()),
        other => Error::External(format!("telegram error: {other}")),
    }
}

/// Bot API errors are descriptive strings; sort them by what the caller can do.
fn classify_api(description: &str) -> Error {
    let d = description.to_ascii_lowercase();
    let permission = [
        "not enough rights",
        "have no rights",
        "forbidden",
        "administrator",
        "can't remove chat owner",
        "user is an administrator",
        "method is available only for supergroups",
    ];
    if permission.iter().any(|p| d.contains(p)) {
        return Error::Permission(description.to_string());
    }
    if d.contains("too many requests") {
        return Error::RateLimited {
            retry_after: None,
            message: description.to_string(),
        };
    }
    if d.contains("internal server error") || d.contains("bad gateway") || d.contains("timeout") {
        return Error::Transient(description.to_string());
    }
    Error::External(description.to_string())
}

#[async_trait]
impl ChatPort for TelegramChat {
    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<MessageRef> {
        let msg = self
            .bot
            .send_message(tg_chat(channel.0), fit(text))
            .await
            .map_err(map_err)?;
        Ok(MessageRef {
            channel_id: channel,
            message_id: MessageId(i64::from(msg.id.0)),
        })
    }

    async fn edit_message(&self, msg: MessageRef, text: &str) -> Result<()> {
        self.bot
            .edit_message_text(tg_chat(msg.channel_id.0), tg_msg(msg.message_id)?, fit(text))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.bot
            .delete_message(tg_chat(msg.channel_id.0), tg_msg(msg.message_id)?)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn ban_member(&self, server: ServerId, user: UserId, reason: Option<&str>) -> Result<()> {
        self.bot
            .ban_chat_member(tg_chat(server.0), tg_user(user)?)
            .await
            .map_err(map_err)?;
        tracing::info!(server = %server, user = %user, reason = reason.unwrap_or(""), "banned member");
        Ok(())
    }

    async fn kick_member(&self, server: ServerId, user: UserId, reason: Option<&str>) -> Result<()> {
        // Telegram has no kick: ban, then lift the ban so the user may rejoin.
        let tg = tg_user(user)?;
        self.bot
            .ban_chat_member(tg_chat(server.0), tg)
            .await
            .map_err(map_err)?;
        self.bot
            .unban_chat_member(tg_chat(server.0), tg)
            .only_if_banned(true)
            .await
            .map_err(map_err)?;
        tracing::info!(server = %server, user = %user, reason = reason.unwrap_or(""), "kicked member");
        Ok(())
    }

    async fn timeout_member(
        &self,
        server: ServerId,
        user: UserId,
        duration: Duration,
        reason: Option<&str>,
    ) -> Result<()> {
        let span = chrono::Duration::from_std(duration.max(MIN_RESTRICTION))
            .map_err(|e| Error::validation(format!("timeout too long: {e}")))?;
        self.bot
            .restrict_chat_member(tg_chat(server.0), tg_user(user)?, ChatPermissions::empty())
            .until_date(Utc::now() + span)
            .await
            .map_err(map_err)?;
        tracing::info!(
            server = %server,
            user = %user,
            secs = duration.as_secs(),
            reason = reason.unwrap_or(""),
            "timed out member"
        );
        Ok(())
    }

    async fn fetch_member(&self, server: ServerId, user: UserId) -> Result<MemberInfo> {
        let member = self
            .bot
            .get_chat_member(tg_chat(server.0), tg_user(user)?)
            .await
            .map_err(map_err)?;
        Ok(MemberInfo {
            user_id: user,
            display_name: Some(convert::display_name(&member.user)),
            roles: Vec::new(),
            is_admin: member.kind.is_privileged(),
            is_bot: member.user.is_bot,
        })
    }

    async fn fetch_channel(&self, channel: ChannelId) -> Result<ChannelInfo> {
        let chat = self
            .bot
            .get_chat(tg_chat(channel.0))
            .await
            .map_err(map_err)?;
        Ok(ChannelInfo {
            channel_id: channel,
            server_id: convert::server_of(&chat),
            name: chat.title().map(str::to_string),
        })
    }
}
