use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use teloxide::{
    dispatching::Dispatcher,
    dptree,
    prelude::*,
    types::{ChatMemberUpdated, Message},
};
use tokio::{sync::mpsc, sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;

use warden_core::chat::ChatEvent;

use crate::convert;

/// How long a group's administrator list is trusted before it is fetched again.
const ADMIN_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct PollState {
    pub events: mpsc::Sender<ChatEvent>,
    pub admins: Arc<AdminCache>,
}

/// Per-chat administrator ids, fetched lazily.
#[derive(Default)]
pub struct AdminCache {
    inner: Mutex<HashMap<i64, (Instant, HashSet<u64>)>>,
}

impl AdminCache {
    pub async fn is_admin(&self, bot: &Bot, chat: teloxide::types::ChatId, user: u64) -> bool {
        let mut map = self.inner.lock().await;
        if let Some((fetched, ids)) = map.get(&chat.0) {
            if fetched.elapsed() < ADMIN_TTL {
                return ids.contains(&user);
            }
        }
        match bot.get_chat_administrators(chat).await {
            Ok(members) => {
                let ids: HashSet<u64> = members.iter().map(|m| m.user.id.0).collect();
                let admin = ids.contains(&user);
                map.insert(chat.0, (Instant::now(), ids));
                admin
            }
            Err(e) => {
                tracing::warn!(chat = chat.0, error = %e, "could not fetch chat administrators");
                false
            }
        }
    }

    pub async fn forget(&self, chat: i64) {
        self.inner.lock().await.remove(&chat);
    }
}

async fn forward(state: &PollState, event: ChatEvent) {
    if state.events.send(event).await.is_err() {
        tracing::debug!("event channel closed, dropping update");
    }
}

async fn on_message(bot: Bot, msg: Message, state: Arc<PollState>) -> ResponseResult<()> {
    let is_admin = match (convert::server_of(&msg.chat), msg.from()) {
        (Some(_), Some(user)) => state.admins.is_admin(&bot, msg.chat.id, user.id.0).await,
        _ => false,
    };
    if let Some(message) = convert::message(&msg, is_admin) {
        forward(&state, ChatEvent::MessageCreated(message)).await;
    }
    Ok(())
}

async fn on_my_membership(update: ChatMemberUpdated, state: Arc<PollState>) -> ResponseResult<()> {
    if let Some(event) = convert::membership(&update) {
        if matches!(event, ChatEvent::ServerLeft { .. }) {
            state.admins.forget(update.chat.id.0).await;
        }
        forward(&state, event).await;
    }
    Ok(())
}

async fn on_admin_change(update: ChatMemberUpdated, state: Arc<PollState>) -> ResponseResult<()> {
    let was = update.old_chat_member.kind.is_privileged();
    let is = update.new_chat_member.kind.is_privileged();
    if was != is {
        state.admins.forget(update.chat.id.0).await;
    }
    Ok(())
}

/// Long-poll Telegram and push translated events into `events` until `cancel` fires.
pub async fn run_polling(
    bot: Bot,
    events: mpsc::Sender<ChatEvent>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let me = bot.get_me().await?;
    tracing::info!(username = %me.username(), "telegram bot connected");
    let bot_user = Some(convert::user_id(&me.user));
    events.send(ChatEvent::Ready { bot_user }).await?;

    let state = Arc::new(PollState {
        events,
        admins: Arc::new(AdminCache::default()),
    });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(on_message))
        .branch(Update::filter_my_chat_member().endpoint(on_my_membership))
        .branch(Update::filter_chat_member().endpoint(on_admin_change));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|_| async {})
        .build();

    let shutdown = dispatcher.shutdown_token();
    let stopper = tokio::spawn(async move {
        cancel.cancelled().await;
        // The dispatcher refuses to stop before it has started polling.
        loop {
            match shutdown.shutdown() {
                Ok(done) => {
                    done.await;
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    });

    dispatcher.dispatch().await;
    stopper.abort();
    tracing::info!("telegram polling stopped");
    Ok(())
}
