//! Test doubles shared by this crate's tests and downstream crates
//! (enable the `testing` feature).

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicI64, AtomicU32, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    chat::{Author, ChannelInfo, ChatMessage, ChatPort, MemberInfo},
    domain::{ChannelId, MessageId, MessageRef, ServerId, UserId},
    Error, Result,
};

/// Recording [`ChatPort`]. Queued failures are returned, one per call, before any
/// call succeeds.
#[derive(Default)]
pub struct FakeChat {
    next_id: AtomicI64,
    attempts: AtomicU32,
    failures: Mutex<VecDeque<Error>>,
    sends: Mutex<Vec<(ChannelId, String)>>,
    edits: Mutex<Vec<(MessageRef, String)>>,
    deletes: Mutex<Vec<MessageRef>>,
    bans: Mutex<Vec<(ServerId, UserId)>>,
    kicks: Mutex<Vec<(ServerId, UserId)>>,
    timeouts: Mutex<Vec<(ServerId, UserId, Duration)>>,
}

impl FakeChat {
    pub fn fail_next(&self, err: Error) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Calls received, failed or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(ChannelId, String)> {
        self.sends.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, t)| t).collect()
    }

    pub fn edited(&self) -> Vec<(MessageRef, String)> {
        self.edits.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<MessageRef> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn banned(&self) -> Vec<(ServerId, UserId)> {
        self.bans.lock().unwrap().clone()
    }

    pub fn kicked(&self) -> Vec<(ServerId, UserId)> {
        self.kicks.lock().unwrap().clone()
    }

    pub fn timed_out(&self) -> Vec<(ServerId, UserId, Duration)> {
        self.timeouts.lock().unwrap().clone()
    }

    fn attempt(&self) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChatPort for FakeChat {
    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<MessageRef> {
        self.attempt()?;
        self.sends.lock().unwrap().push((channel, text.to_string()));
        Ok(MessageRef {
            channel_id: channel,
            message_id: MessageId(1000 + self.next_id.fetch_add(1, Ordering::SeqCst)),
        })
    }

    async fn edit_message(&self, msg: MessageRef, text: &str) -> Result<()> {
        self.attempt()?;
        self.edits.lock().unwrap().push((msg, text.to_string()));
        Ok(())
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.attempt()?;
        self.deletes.lock().unwrap().push(msg);
        Ok(())
    }

    async fn ban_member(&self, server: ServerId, user: UserId, _reason: Option<&str>) -> Result<()> {
        self.attempt()?;
        self.bans.lock().unwrap().push((server, user));
        Ok(())
    }

    async fn kick_member(&self, server: ServerId, user: UserId, _reason: Option<&str>) -> Result<()> {
        self.attempt()?;
        self.kicks.lock().unwrap().push((server, user));
        Ok(())
    }

    async fn timeout_member(
        &self,
        server: ServerId,
        user: UserId,
        duration: Duration,
        _reason: Option<&str>,
    ) -> Result<()> {
        self.attempt()?;
        self.timeouts.lock().unwrap().push((server, user, duration));
        Ok(())
    }

    async fn fetch_member(&self, _server: ServerId, user: UserId) -> Result<MemberInfo> {
        self.attempt()?;
        Ok(MemberInfo {
            user_id: user,
            display_name: None,
            roles: Vec::new(),
            is_admin: false,
            is_bot: false,
        })
    }

    async fn fetch_channel(&self, channel: ChannelId) -> Result<ChannelInfo> {
        self.attempt()?;
        Ok(ChannelInfo {
            channel_id: channel,
            server_id: Some(ServerId(channel.0)),
            name: None,
        })
    }
}

/// A plain server message from a non-admin human.
pub fn message(server: i64, channel: i64, user: i64, content: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId(1),
        server_id: Some(ServerId(server)),
        channel_id: ChannelId(channel),
        author: Author {
            id: UserId(user),
            name: Some(format!("user{user}")),
            roles: Vec::new(),
            is_admin: false,
            is_bot: false,
        },
        content: content.to_string(),
        mention_count: 0,
    }
}
