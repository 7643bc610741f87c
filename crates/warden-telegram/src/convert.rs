//! Translation from Telegram updates to warden events.

use teloxide::types::{Chat, ChatMemberUpdated, Message, MessageEntity, MessageEntityKind, User};

use warden_core::{
    chat::{Author, ChatEvent, ChatMessage},
    domain::{ChannelId, MessageId, ServerId, UserId},
};

pub fn display_name(user: &User) -> String {
    match &user.username {
        Some(name) => format!("@{name}"),
        None => user.full_name(),
    }
}

/// Groups and supergroups are servers; private chats are direct messages.
pub fn server_of(chat: &Chat) -> Option<ServerId> {
    if chat.is_group() || chat.is_supergroup() {
        Some(ServerId(chat.id.0))
    } else {
        None
    }
}

fn count_mentions(entities: Option<&[MessageEntity]>) -> usize {
    entities
        .unwrap_or_default()
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                MessageEntityKind::Mention | MessageEntityKind::TextMention { .. }
            )
        })
        .count()
}

/// A user message as a [`ChatMessage`]. Channel posts and anonymous senders yield
/// `None`. `is_admin` is supplied by the caller, which knows the chat's admins.
pub fn message(msg: &Message, is_admin: bool) -> Option<ChatMessage> {
    if msg.chat.is_channel() {
        return None;
    }
    let from = msg.from()?;
    let content = msg.text().or_else(|| msg.caption())?;
    let mention_count = count_mentions(msg.entities()) + count_mentions(msg.caption_entities());

    Some(ChatMessage {
        id: MessageId(i64::from(msg.id.0)),
        server_id: server_of(&msg.chat),
        channel_id: ChannelId(msg.chat.id.0),
        author: Author {
            id: user_id(from),
            name: Some(display_name(from)),
            roles: Vec::new(),
            is_admin,
            is_bot: from.is_bot,
        },
        content: content.to_string(),
        mention_count,
    })
}

pub fn user_id(user: &User) -> UserId {
    // Telegram user ids fit in 52 bits.
    UserId(user.id.0 as i64)
}

/// The bot's own membership changed: joined or left a group.
pub fn membership(update: &ChatMemberUpdated) -> Option<ChatEvent> {
    let server_id = server_of(&update.chat)?;
    let present = |m: &teloxide::types::ChatMember| !(m.kind.is_left() || m.kind.is_banned());

    match (present(&update.old_chat_member), present(&update.new_chat_member)) {
        (false, true) => Some(ChatEvent::ServerJoined {
            server_id,
            name: update.chat.title().map(str::to_string),
        }),
        (true, false) => Some(ChatEvent::ServerLeft { server_id }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: serde_json::Value) -> Message {
        serde_json::from_value(v).unwrap()
    }

    fn group_message(text: &str) -> serde_json::Value {
        json!({
            "message_id": 77,
            "date": 1_700_000_000,
            "chat": { "id": -100123, "title": "Lobby", "type": "supergroup" },
            "from": { "id": 42, "is_bot": false, "first_name": "Ada", "username": "ada" },
            "text": text,
            "entities": [
                { "type": "mention", "offset": 0, "length": 4 },
                { "type": "bold", "offset": 5, "length": 2 },
                { "type": "mention", "offset": 8, "length": 4 }
            ]
        })
    }

    #[test]
    fn group_messages_belong_to_a_server() {
        let msg = parse(group_message("@bob hi @eve"));
        let out = message(&msg, true).unwrap();
        assert_eq!(out.id, MessageId(77));
        assert_eq!(out.server_id, Some(ServerId(-100123)));
        assert_eq!(out.channel_id, ChannelId(-100123));
        assert_eq!(out.author.id, UserId(42));
        assert_eq!(out.author.name.as_deref(), Some("@ada"));
        assert!(out.author.is_admin);
        assert_eq!(out.content, "@bob hi @eve");
        assert_eq!(out.mention_count, 2);
    }

    #[test]
    fn private_messages_have_no_server() {
        let msg = parse(json!({
            "message_id": 3,
            "date": 1_700_000_000,
            "chat": { "id": 42, "first_name": "Ada", "type": "private" },
            "from": { "id": 42, "is_bot": false, "first_name": "Ada", "last_name": "L" },
            "text": "!balance"
        }));
        let out = message(&msg, false).unwrap();
        assert_eq!(out.server_id, None);
        assert_eq!(out.channel_id, ChannelId(42));
        assert_eq!(out.author.name.as_deref(), Some("Ada L"));
        assert_eq!(out.mention_count, 0);
    }

    #[test]
    fn messages_without_text_are_skipped() {
        let msg = parse(json!({
            "message_id": 4,
            "date": 1_700_000_000,
            "chat": { "id": -5, "title": "g", "type": "group" },
            "from": { "id": 1, "is_bot": false, "first_name": "A" },
            "photo": [{ "file_id": "x", "file_unique_id": "y", "width": 90, "height": 90 }]
        }));
        assert!(message(&msg, false).is_none());
    }
}
