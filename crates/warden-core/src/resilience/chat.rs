use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    chat::{
        port::ChatPort,
        types::{ChannelInfo, MemberInfo},
    },
    domain::{ChannelId, MessageRef, ServerId, UserId},
    resilience::Resilience,
    Result,
};

/// ChatPort decorator that routes every outbound call through retry + circuit breaker.
///
/// The adapter below it should not retry on its own; throttling hints surface as
/// [`crate::Error::RateLimited`] and are honoured here.
pub struct ResilientChat {
    inner: Arc<dyn ChatPort>,
    resilience: Arc<Resilience>,
}

impl ResilientChat {
    pub fn new(inner: Arc<dyn ChatPort>, resilience: Arc<Resilience>) -> Self {
        Self { inner, resilience }
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }
}

#[async_trait]
impl ChatPort for ResilientChat {
    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<MessageRef> {
        self.resilience
            .run("send_message", || self.inner.send_message(channel, text))
            .await
    }

    async fn edit_message(&self, msg: MessageRef, text: &str) -> Result<()> {
        self.resilience
            .run("edit_message", || self.inner.edit_message(msg, text))
            .await
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.resilience
            .run("delete_message", || self.inner.delete_message(msg))
            .await
    }

    async fn ban_member(
        &self,
        server: ServerId,
        user: UserId,
        reason: Option<&str>,
    ) -> Result<()> {
        self.resilience
            .run("ban_member", || self.inner.ban_member(server, user, reason))
            .await
    }

    async fn kick_member(
        &self,
        server: ServerId,
        user: UserId,
        reason: Option<&str>,
    ) -> Result<()> {
        self.resilience
            .run("kick_member", || self.inner.kick_member(server, user, reason))
            .await
    }

    async fn timeout_member(
        &self,
        server: ServerId,
        user: UserId,
        duration: Duration,
        reason: Option<&str>,
    ) -> Result<()> {
        self.resilience
            .run("timeout_member", || {
                self.inner.timeout_member(server, user, duration, reason)
            })
            .await
    }

    async fn fetch_member(&self, server: ServerId, user: UserId) -> Result<MemberInfo> {
        self.resilience
            .run("fetch_member", || self.inner.fetch_member(server, user))
            .await
    }

    async fn fetch_channel(&self, channel: ChannelId) -> Result<ChannelInfo> {
        self.resilience
            .run("fetch_channel", || self.inner.fetch_channel(channel))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::MessageId,
        resilience::{BreakerConfig, RetryPolicy},
        testing::FakeChat,
        Error,
    };

    fn wrap(fake: Arc<FakeChat>) -> ResilientChat {
        ResilientChat::new(
            fake,
            Arc::new(Resilience::new(
                "chat",
                RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(50),
                },
                BreakerConfig::default(),
                None,
            )),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_throttled_deletes() {
        let fake = Arc::new(FakeChat::default());
        fake.fail_next(Error::RateLimited {
            retry_after: Some(Duration::from_millis(20)),
            message: "429".into(),
        });
        let chat = wrap(fake.clone());

        let msg = MessageRef {
            channel_id: ChannelId(1),
            message_id: MessageId(9),
        };
        chat.delete_message(msg).await.unwrap();
        assert_eq!(fake.deleted(), vec![msg]);
        assert_eq!(fake.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_bans_are_attempted_once() {
        let fake = Arc::new(FakeChat::default());
        fake.fail_next(Error::Permission("bot is not an admin".into()));
        let chat = wrap(fake.clone());

        let err = chat
            .ban_member(ServerId(1), UserId(2), Some("spam"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
        assert_eq!(fake.attempts(), 1);
    }
}
