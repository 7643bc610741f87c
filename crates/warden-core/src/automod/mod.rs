//! Automoderation: per-user sliding-window spam detection, content filters, a
//! decaying violation score and escalating actions.

mod filters;
mod history;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    chat::{ChatMessage, ChatPort},
    domain::{ServerId, UserId},
    persistence::{
        model::{AutomodConfig, ServerConfig, StoredViolation, ViolationKind, ViolationRecord},
        Persistence,
    },
    Result,
};

pub use filters::{ContentFilters, Violation};
pub use history::{MessageHistory, ModerationState, ESCALATION_SCORE, RAPID_REPEAT_COUNT};

/// What automod decided about one message.
#[derive(Clone, Debug, PartialEq)]
pub struct Verdict {
    pub state: ModerationState,
    pub violations: Vec<Violation>,
    pub score: f64,
}

impl Verdict {
    fn clean() -> Self {
        Self {
            state: ModerationState::Normal,
            violations: Vec::new(),
            score: 0.0,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Cheap-to-clone handle to the automod engine.
#[derive(Clone)]
pub struct AutoModerator {
    inner: Arc<AutomodInner>,
}

struct AutomodInner {
    persistence: Persistence,
    chat: Arc<dyn ChatPort>,
    filters: ContentFilters,
    history: Mutex<HashMap<(ServerId, UserId), MessageHistory>>,
    history_ttl: Duration,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AutoModerator {
    /// `chat` should be the resilient port; action failures are only logged.
    pub fn new(persistence: Persistence, chat: Arc<dyn ChatPort>, history_ttl: Duration) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(AutomodInner {
                persistence,
                chat,
                filters: ContentFilters::new()?,
                history: Mutex::new(HashMap::new()),
                history_ttl,
                cancel: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        })
    }

    /// Spawn the periodic history sweep.
    pub fn start(&self, sweep_interval: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = this.inner.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let pruned = this.prune_history_at(Instant::now());
                        if pruned > 0 {
                            tracing::debug!(pruned, "automod history sweep");
                        }
                    }
                }
            }
        });
        *lock(&self.inner.sweeper) = Some(handle);
    }

    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = lock(&self.inner.sweeper).take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }

    /// Evaluate `msg` and run the configured actions.
    pub async fn check(&self, msg: &ChatMessage) -> Result<Verdict> {
        let Some(server) = msg.server_id else {
            return Ok(Verdict::clean());
        };
        let cfg = self.inner.persistence.server_config(server).await?;
        self.check_with(msg, &cfg, Instant::now()).await
    }

    /// Like [`AutoModerator::check`], with the server config and clock supplied.
    pub async fn check_with(&self, msg: &ChatMessage, cfg: &ServerConfig, now: Instant) -> Result<Verdict> {
        let verdict = self.evaluate(msg, cfg, now);
        if !verdict.is_clean() {
            self.enforce(msg, cfg, &verdict).await;
        }
        Ok(verdict)
    }

    /// Detection and scoring only; no I/O. Callers that need strict ordering run
    /// this inline and [`AutoModerator::enforce`] elsewhere.
    pub fn evaluate(&self, msg: &ChatMessage, cfg: &ServerConfig, now: Instant) -> Verdict {
        let Some(server) = msg.server_id else {
            return Verdict::clean();
        };
        let am = &cfg.automod;
        if !cfg.features.automod || !am.enabled || msg.author.is_bot || is_exempt(msg, am) {
            return Verdict::clean();
        }
        let verdict = self.detect(server, msg, am, now);
        if !verdict.is_clean() {
            tracing::info!(
                server = %server,
                user = %msg.author.id,
                violations = verdict.violations.len(),
                score = verdict.score,
                state = ?verdict.state,
                "automod flagged message"
            );
        }
        verdict
    }

    /// Run the configured actions for a flagged message. Failures are logged.
    pub async fn enforce(&self, msg: &ChatMessage, cfg: &ServerConfig, verdict: &Verdict) {
        if let Some(server) = msg.server_id {
            self.act(server, msg, &cfg.automod, verdict).await;
        }
    }

    fn detect(&self, server: ServerId, msg: &ChatMessage, am: &AutomodConfig, now: Instant) -> Verdict {
        let mut violations = Vec::new();

        let mut history = lock(&self.inner.history);
        let entry = history
            .entry((server, msg.author.id))
            .or_insert_with(|| MessageHistory::new(now));

        let count = if am.spam.enabled {
            let window = Duration::from_secs(am.spam.window_secs);
            let count = entry.observe(now, window);
            if count > am.spam.threshold as usize {
                violations.push(Violation {
                    kind: ViolationKind::Spam,
                    details: format!(
                        "{count} messages in {}s (max {})",
                        am.spam.window_secs, am.spam.threshold
                    ),
                });
            }
            if am.spam.rapid_repeat && count >= RAPID_REPEAT_COUNT {
                violations.push(Violation {
                    kind: ViolationKind::RapidRepeat,
                    details: format!("{count} rapid messages"),
                });
            }
            count
        } else {
            entry.observe(now, Duration::ZERO)
        };

        violations.extend(self.inner.filters.check(msg, am));

        let state = entry.score_message(violations.len(), count, am.spam.threshold);
        Verdict {
            state,
            score: entry.score(),
            violations,
        }
    }

    async fn act(&self, server: ServerId, msg: &ChatMessage, am: &AutomodConfig, verdict: &Verdict) {
        let chat = &self.inner.chat;
        let actions = &am.actions;
        let user = msg.author.id;
        let kinds = verdict
            .violations
            .iter()
            .map(|v| v.kind.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        if actions.delete_message {
            if let Err(e) = chat.delete_message(msg.reference()).await {
                tracing::warn!(server = %server, user = %user, error = %e, "automod delete failed");
            }
        }

        if actions.log_violation {
            let timestamp = Utc::now();
            for v in &verdict.violations {
                let record = ViolationRecord {
                    kind: v.kind,
                    server_id: server,
                    user_id: user,
                    channel_id: msg.channel_id,
                    message_id: Some(msg.id),
                    timestamp,
                    details: v.details.clone(),
                };
                if let Err(e) = self.inner.persistence.record_violation(record).await {
                    tracing::warn!(server = %server, user = %user, error = %e, "violation not recorded");
                }
            }
        }

        if actions.warn {
            let name = msg.author.name.as_deref().unwrap_or("user");
            let text = format!("{name}, your message was flagged by automod ({kinds}).");
            if let Err(e) = chat.send_message(msg.channel_id, &text).await {
                tracing::warn!(server = %server, user = %user, error = %e, "automod warning failed");
            }
        }

        let escalated = verdict.state == ModerationState::Escalated;
        if escalated || actions.timeout {
            let duration = Duration::from_secs(actions.timeout_secs);
            let reason = format!("automod: {kinds}");
            match chat.timeout_member(server, user, duration, Some(&reason)).await {
                Ok(()) => tracing::info!(server = %server, user = %user, ?duration, escalated, "user timed out"),
                Err(e) => tracing::warn!(server = %server, user = %user, error = %e, "automod timeout failed"),
            }
        }

        if let Some(log_channel) = am.log_channel {
            let text = format!(
                "automod: {kinds} by {} in {} (score {:.1}, {:?})",
                user, msg.channel_id, verdict.score, verdict.state
            );
            if let Err(e) = chat.send_message(log_channel, &text).await {
                tracing::debug!(error = %e, "automod log channel post failed");
            }
        }
    }

    /// Current score for a user, if a window exists.
    pub fn user_score(&self, server: ServerId, user: UserId) -> Option<f64> {
        lock(&self.inner.history).get(&(server, user)).map(MessageHistory::score)
    }

    pub fn tracked_users(&self) -> usize {
        lock(&self.inner.history).len()
    }

    /// Drop windows idle for longer than the history TTL.
    pub fn prune_history_at(&self, now: Instant) -> usize {
        let ttl = self.inner.history_ttl;
        let mut history = lock(&self.inner.history);
        let before = history.len();
        history.retain(|_, h| h.idle_for(now) <= ttl);
        before - history.len()
    }

    /// Forget every window for a server (e.g. the bot left it).
    pub fn forget_server(&self, server: ServerId) {
        lock(&self.inner.history).retain(|(s, _), _| *s != server);
    }

    pub async fn recent_violations(
        &self,
        server: ServerId,
        user: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<StoredViolation>> {
        self.inner
            .persistence
            .recent_violations(server, user, limit)
            .await
    }
}

fn is_exempt(msg: &ChatMessage, am: &AutomodConfig) -> bool {
    let wl = &am.whitelist;
    wl.users.contains(&msg.author.id)
        || wl.channels.contains(&msg.channel_id)
        || msg.author.roles.iter().any(|r| wl.roles.contains(r))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}
