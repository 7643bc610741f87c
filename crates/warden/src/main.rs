use std::sync::Arc;

use anyhow::Context;
use teloxide::Bot;
use tokio_util::sync::CancellationToken;

use warden_commands::Rewards;
use warden_core::{
    automod::AutoModerator,
    chat::ChatPort,
    config::Config,
    dispatcher::{Dispatcher, Services},
    persistence::{MemoryStore, Persistence, PersistenceSettings, Store},
    resilience::{Resilience, ResilientChat},
    runtime::{self, Runtime},
};
use warden_sqlite::SqliteStore;
use warden_telegram::{router::run_polling, TelegramChat};

const MEMORY_URL: &str = "memory:";
const EVENT_BUFFER: usize = 1024;

async fn open_store(url: &str) -> warden_core::Result<Arc<dyn Store>> {
    if url == MEMORY_URL {
        tracing::warn!("using the in-memory store; nothing survives a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(SqliteStore::connect(url).await?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    warden_core::logging::init("warden")?;

    let cfg = Config::load()?;
    let token = cfg.require_token()?.to_string();

    let store = open_store(&cfg.database_url)
        .await
        .context("store unavailable")?;
    let persistence = Persistence::open(store, PersistenceSettings::from_config(&cfg));

    let bot = Bot::new(token);
    let chat_resilience = Arc::new(Resilience::new(
        "chat",
        cfg.retry,
        cfg.breaker,
        Some(cfg.request_timeout),
    ));
    let chat: Arc<dyn ChatPort> = Arc::new(ResilientChat::new(
        Arc::new(TelegramChat::new(bot.clone())),
        chat_resilience,
    ));

    let automod = AutoModerator::new(persistence.clone(), chat.clone(), cfg.history_ttl)?;
    automod.start(cfg.history_sweep_interval);

    let dispatcher = Dispatcher::new(cfg.command_cache_ttl);
    dispatcher
        .load(&warden_commands::manifest(Rewards::default()))
        .await
        .context("loading commands")?;
    dispatcher.start(cfg.rate_limit_sweep_interval);

    let services = Services {
        persistence: persistence.clone(),
        chat,
        automod: automod.clone(),
        owners: cfg.owners.clone(),
    };

    let cancel = CancellationToken::new();
    let (events, runtime_task) = runtime::spawn(
        Runtime::new(dispatcher.clone(), services),
        EVENT_BUFFER,
        cancel.clone(),
    );
    let mut polling = tokio::spawn(run_polling(bot, events, cancel.clone()));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!(error = %e, "could not listen for ctrl-c");
            }
            tracing::info!("shutdown requested");
        }
        res = &mut polling => match res {
            Ok(Ok(())) => tracing::warn!("telegram polling ended"),
            Ok(Err(e)) => tracing::error!(error = %e, "telegram polling failed"),
            Err(e) => tracing::error!(error = %e, "telegram polling panicked"),
        },
    }

    cancel.cancel();
    if !polling.is_finished() {
        match polling.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "telegram polling failed"),
            Err(e) => tracing::error!(error = %e, "telegram polling panicked"),
        }
    }
    match runtime_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "runtime failed"),
        Err(e) => tracing::error!(error = %e, "runtime panicked"),
    }

    dispatcher.shutdown().await;
    automod.shutdown().await;
    persistence.shutdown().await;
    tracing::info!("warden stopped");
    Ok(())
}
