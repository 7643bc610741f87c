use crate::domain::{ChannelId, MessageId, MessageRef, RoleId, ServerId, UserId};

/// Inbound events supplied by the transport adapter.
#[derive(Clone, Debug)]
pub enum ChatEvent {
    MessageCreated(ChatMessage),
    ServerJoined {
        server_id: ServerId,
        name: Option<String>,
    },
    ServerLeft {
        server_id: ServerId,
    },
    ChannelCreated {
        server_id: ServerId,
        channel_id: ChannelId,
    },
    ChannelDeleted {
        server_id: ServerId,
        channel_id: ChannelId,
    },
    Ready {
        bot_user: Option<UserId>,
    },
    Reconnected,
}

#[derive(Clone, Debug)]
pub struct Author {
    pub id: UserId,
    pub name: Option<String>,
    pub roles: Vec<RoleId>,
    pub is_admin: bool,
    pub is_bot: bool,
}

#[derive(Clone, Debug)]
pub struct ChatMessage {
    pub id: MessageId,
    /// `None` for direct messages.
    pub server_id: Option<ServerId>,
    pub channel_id: ChannelId,
    pub author: Author,
    pub content: String,
    /// User/role mentions counted by the transport.
    pub mention_count: usize,
}

impl ChatMessage {
    pub fn reference(&self) -> MessageRef {
        MessageRef {
            channel_id: self.channel_id,
            message_id: self.id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MemberInfo {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub roles: Vec<RoleId>,
    pub is_admin: bool,
    pub is_bot: bool,
}

#[derive(Clone, Debug)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    pub server_id: Option<ServerId>,
    pub name: Option<String>,
}
