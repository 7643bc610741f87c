use std::time::Duration;

use async_trait::async_trait;

use crate::{
    chat::types::{ChannelInfo, MemberInfo},
    domain::{ChannelId, MessageRef, ServerId, UserId},
    Result,
};

/// Outbound calls against the chat platform.
///
/// Implementations map platform failures onto [`crate::Error`] so callers (and the
/// resilience layer) can tell throttling and permission denials from transient blips.
#[async_trait]
pub trait ChatPort: Send + Sync {
    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<MessageRef>;
    async fn edit_message(&self, msg: MessageRef, text: &str) -> Result<()>;
    async fn delete_message(&self, msg: MessageRef) -> Result<()>;

    async fn ban_member(&self, server: ServerId, user: UserId, reason: Option<&str>)
        -> Result<()>;
    async fn kick_member(
        &self,
        server: ServerId,
        user: UserId,
        reason: Option<&str>,
    ) -> Result<()>;
    async fn timeout_member(
        &self,
        server: ServerId,
        user: UserId,
        duration: Duration,
        reason: Option<&str>,
    ) -> Result<()>;

    async fn fetch_member(&self, server: ServerId, user: UserId) -> Result<MemberInfo>;
    async fn fetch_channel(&self, channel: ChannelId) -> Result<ChannelInfo>;
}
