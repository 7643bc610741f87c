//! Command registry, alias resolution, per-user rate limiting and execution.

pub mod command;
mod rate_limit;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::future::join_all;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{chat::ChatMessage, persistence::model::ServerConfig, Error, Result};

pub use command::{
    factory, Command, CommandCategory, CommandContext, CommandDescriptor, CommandFactory,
    CommandFlags, Manifest, RateLimitPolicy, Services, StaticCategory,
};
pub use rate_limit::{RateDecision, RateLimitState, RateLimiter};

// ============== Load statistics ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategoryStats {
    pub category: String,
    pub loaded: usize,
    pub skipped: usize,
    pub elapsed: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub categories: Vec<CategoryStats>,
    pub loaded: usize,
    pub skipped: usize,
    pub elapsed: Duration,
}

// ============== Outcomes ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Forbidden {
    OwnerOnly,
    AdminOnly,
    ServerOnly,
    Disabled,
}

/// Result of the synchronous half of dispatch.
pub enum Prepared {
    NotACommand,
    Unknown { name: String },
    Forbidden { command: String, reason: Forbidden },
    RateLimited { command: String, remaining: Duration },
    Ready(Invocation),
}

/// A resolved, admitted command waiting to run.
pub struct Invocation {
    command: Arc<dyn Command>,
    descriptor: CommandDescriptor,
    ctx: CommandContext,
}

impl Invocation {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    pub fn context(&self) -> &CommandContext {
        &self.ctx
    }

    /// Run the body. Errors are logged and returned.
    pub async fn run(self) -> Result<()> {
        let started = Instant::now();
        let res = self.command.execute(&self.ctx).await;
        match &res {
            Ok(()) => tracing::debug!(
                command = %self.descriptor.name,
                user = %self.ctx.author(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "command executed"
            ),
            Err(Error::Validation(msg)) => tracing::debug!(
                command = %self.descriptor.name,
                user = %self.ctx.author(),
                %msg,
                "command rejected arguments"
            ),
            Err(e) => tracing::error!(
                command = %self.descriptor.name,
                user = %self.ctx.author(),
                error = %e,
                "command failed"
            ),
        }
        res
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    NotACommand,
    Unknown { name: String },
    Forbidden { command: String, reason: Forbidden },
    RateLimited { command: String, remaining: Duration },
    Executed { command: String },
}

// ============== Registry ==============

struct Registered {
    command: Arc<dyn Command>,
    descriptor: CommandDescriptor,
    factory: CommandFactory,
}

#[derive(Default)]
struct Registry {
    commands: HashMap<String, Registered>,
    /// alias -> canonical name
    aliases: HashMap<String, String>,
}

impl Registry {
    fn is_taken(&self, key: &str) -> bool {
        self.commands.contains_key(key) || self.aliases.contains_key(key)
    }

    fn register(&mut self, reg: Registered) -> Result<()> {
        let d = &reg.descriptor;
        if self.is_taken(&d.name) {
            return Err(Error::validation(format!("command name {} already taken", d.name)));
        }
        for (i, alias) in d.aliases.iter().enumerate() {
            if self.is_taken(alias) || d.aliases[..i].contains(alias) {
                return Err(Error::validation(format!(
                    "alias {alias} of {} collides with another command",
                    d.name
                )));
            }
        }
        for alias in &d.aliases {
            self.aliases.insert(alias.clone(), d.name.clone());
        }
        self.commands.insert(d.name.clone(), reg);
        Ok(())
    }

    fn unregister(&mut self, name: &str) -> Option<Registered> {
        let reg = self.commands.remove(name)?;
        for alias in &reg.descriptor.aliases {
            self.aliases.remove(alias);
        }
        Some(reg)
    }

    fn canonical(&self, key: &str) -> Option<&str> {
        if let Some((name, _)) = self.commands.get_key_value(key) {
            return Some(name.as_str());
        }
        self.aliases.get(key).map(String::as_str)
    }
}

// ============== Dispatcher ==============

/// Cheap-to-clone handle to the command dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Mutex<Registry>,
    resolve_cache: Mutex<HashMap<String, (String, Instant)>>,
    cache_ttl: Duration,
    limiter: RateLimiter,
    stats: Mutex<LoadReport>,
    executions: Mutex<HashMap<String, u64>>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry: Mutex::new(Registry::default()),
                resolve_cache: Mutex::new(HashMap::new()),
                cache_ttl,
                limiter: RateLimiter::new(),
                stats: Mutex::new(LoadReport::default()),
                executions: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Load every category concurrently on the calling task and register the
    /// results. Invalid entries are skipped and counted; a category that cannot be
    /// listed fails the whole load and nothing is registered.
    pub async fn load(&self, manifest: &Manifest) -> Result<LoadReport> {
        let started = Instant::now();
        let built = join_all(manifest.iter().map(|cat| build_category(cat.as_ref())))
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let mut report = LoadReport::default();
        for (mut stats, commands) in built {
            let mut registry = lock(&self.inner.registry);
            for reg in commands {
                let name = reg.descriptor.name.clone();
                match registry.register(reg) {
                    Ok(()) => stats.loaded += 1,
                    Err(e) => {
                        tracing::warn!(category = %stats.category, command = %name, error = %e, "skipping command");
                        stats.skipped += 1;
                    }
                }
            }
            drop(registry);
            tracing::info!(
                category = %stats.category,
                loaded = stats.loaded,
                skipped = stats.skipped,
                elapsed_ms = stats.elapsed.as_millis() as u64,
                "command category loaded"
            );
            report.loaded += stats.loaded;
            report.skipped += stats.skipped;
            report.categories.push(stats);
        }
        report.elapsed = started.elapsed();
        lock(&self.inner.resolve_cache).clear();

        tracing::info!(
            loaded = report.loaded,
            skipped = report.skipped,
            categories = report.categories.len(),
            "commands loaded"
        );
        *lock(&self.inner.stats) = report.clone();
        Ok(report)
    }

    pub fn stats(&self) -> LoadReport {
        lock(&self.inner.stats).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.registry).commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptors of all visible commands, sorted by category then name.
    pub fn commands(&self) -> Vec<CommandDescriptor> {
        let mut out: Vec<CommandDescriptor> = lock(&self.inner.registry)
            .commands
            .values()
            .filter(|r| !r.descriptor.flags.hidden)
            .map(|r| r.descriptor.clone())
            .collect();
        out.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
        out
    }

    pub fn executions(&self, name: &str) -> u64 {
        lock(&self.inner.executions).get(name).copied().unwrap_or(0)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    // ============== Resolve ==============

    /// Look up a command by name or alias (case-insensitive).
    pub fn resolve(&self, name: &str) -> Option<(Arc<dyn Command>, CommandDescriptor)> {
        self.resolve_at(name, Instant::now())
    }

    fn resolve_at(&self, name: &str, now: Instant) -> Option<(Arc<dyn Command>, CommandDescriptor)> {
        let key = name.to_lowercase();

        let cached = lock(&self.inner.resolve_cache)
            .get(&key)
            .filter(|(_, at)| now.saturating_duration_since(*at) < self.inner.cache_ttl)
            .map(|(canonical, _)| canonical.clone());

        let registry = lock(&self.inner.registry);
        if let Some(canonical) = cached {
            if let Some(reg) = registry.commands.get(&canonical) {
                return Some((reg.command.clone(), reg.descriptor.clone()));
            }
        }

        let canonical = registry.canonical(&key)?.to_string();
        let reg = registry.commands.get(&canonical)?;
        let found = (reg.command.clone(), reg.descriptor.clone());
        drop(registry);

        lock(&self.inner.resolve_cache).insert(key, (canonical, now));
        Some(found)
    }

    fn invalidate(&self, keys: &[String], canonical: &str) {
        let mut cache = lock(&self.inner.resolve_cache);
        for k in keys {
            cache.remove(k);
        }
        cache.retain(|_, (name, _)| name != canonical);
    }

    // ============== Reload ==============

    /// Rebuild a command from its factory and swap it in. On failure the previous
    /// instance stays registered.
    pub fn reload(&self, name: &str) -> Result<CommandDescriptor> {
        let key = name.to_lowercase();
        let mut registry = lock(&self.inner.registry);
        let canonical = registry
            .canonical(&key)
            .map(str::to_string)
            .ok_or_else(|| Error::validation(format!("unknown command: {name}")))?;
        let old = registry
            .unregister(&canonical)
            .ok_or_else(|| Error::validation(format!("unknown command: {name}")))?;

        let mut stale: Vec<String> = old.descriptor.aliases.clone();
        stale.push(old.descriptor.name.clone());

        let rebuilt = build_one(&old.factory, &old.descriptor.category);
        let result = match rebuilt {
            Ok(reg) => {
                let descriptor = reg.descriptor.clone();
                stale.extend(descriptor.aliases.iter().cloned());
                match registry.register(reg) {
                    Ok(()) => Ok(descriptor),
                    Err(e) => Err((e, old)),
                }
            }
            Err(e) => Err((e, old)),
        };

        let out = match result {
            Ok(descriptor) => {
                tracing::info!(command = %descriptor.name, "command reloaded");
                Ok(descriptor)
            }
            Err((e, old)) => {
                tracing::warn!(command = %canonical, error = %e, "reload failed, keeping previous version");
                // The old entry was registered a moment ago, so this cannot collide.
                let _ = registry.register(old);
                Err(e)
            }
        };
        drop(registry);
        self.invalidate(&stale, &canonical);
        out
    }

    // ============== Execute ==============

    /// Synchronous half of dispatch: parse, resolve, check flags, apply the rate
    /// limit. Call in arrival order.
    pub fn prepare(
        &self,
        message: &ChatMessage,
        prefix: &str,
        config: &ServerConfig,
        services: &Services,
    ) -> Prepared {
        self.prepare_at(message, prefix, config, services, Instant::now())
    }

    pub fn prepare_at(
        &self,
        message: &ChatMessage,
        prefix: &str,
        config: &ServerConfig,
        services: &Services,
        now: Instant,
    ) -> Prepared {
        let Some(rest) = message.content.strip_prefix(prefix) else {
            return Prepared::NotACommand;
        };
        if prefix.is_empty() {
            return Prepared::NotACommand;
        }
        let mut tokens = rest.split_whitespace();
        let Some(first) = tokens.next() else {
            return Prepared::NotACommand;
        };
        // "! ping" is not a command.
        if rest.starts_with(char::is_whitespace) {
            return Prepared::NotACommand;
        }
        let invoked_as = first.to_lowercase();
        let args: Vec<String> = tokens.map(str::to_string).collect();

        let Some((command, descriptor)) = self.resolve_at(&invoked_as, now) else {
            return Prepared::Unknown { name: invoked_as };
        };

        let ctx = CommandContext {
            message: message.clone(),
            invoked_as,
            args,
            prefix: prefix.to_string(),
            config: config.clone(),
            services: services.clone(),
            dispatcher: self.clone(),
        };

        if let Some(reason) = forbidden(&descriptor, &ctx) {
            return Prepared::Forbidden {
                command: descriptor.name,
                reason,
            };
        }

        match self
            .inner
            .limiter
            .check_at(ctx.author(), &descriptor.name, descriptor.rate_limit, now)
        {
            RateDecision::Limited { remaining } => {
                return Prepared::RateLimited {
                    command: descriptor.name,
                    remaining,
                }
            }
            RateDecision::Allowed { .. } => {}
        }

        *lock(&self.inner.executions)
            .entry(descriptor.name.clone())
            .or_default() += 1;

        Prepared::Ready(Invocation {
            command,
            descriptor,
            ctx,
        })
    }

    /// `prepare` then `run` on the current task.
    pub async fn execute(
        &self,
        message: &ChatMessage,
        prefix: &str,
        config: &ServerConfig,
        services: &Services,
    ) -> Result<Outcome> {
        Ok(match self.prepare(message, prefix, config, services) {
            Prepared::NotACommand => Outcome::NotACommand,
            Prepared::Unknown { name } => Outcome::Unknown { name },
            Prepared::Forbidden { command, reason } => Outcome::Forbidden { command, reason },
            Prepared::RateLimited { command, remaining } => {
                Outcome::RateLimited { command, remaining }
            }
            Prepared::Ready(inv) => {
                let command = inv.name().to_string();
                inv.run().await?;
                Outcome::Executed { command }
            }
        })
    }

    // ============== Background ==============

    /// Spawn the periodic rate-limit state sweep.
    pub fn start(&self, sweep_interval: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = this.inner.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let pruned = this.inner.limiter.prune_at(Instant::now());
                        if pruned > 0 {
                            tracing::debug!(pruned, "rate-limit sweep");
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
}

fn forbidden(d: &CommandDescriptor, ctx: &CommandContext) -> Option<Forbidden> {
    if d.flags.server_only && ctx.message.server_id.is_none() {
        return Some(Forbidden::ServerOnly);
    }
    if d.flags.owner_only && !ctx.is_owner() {
        return Some(Forbidden::OwnerOnly);
    }
    if d.flags.admin_only && !ctx.is_admin() {
        return Some(Forbidden::AdminOnly);
    }
    let disabled = &ctx.config.security.disabled_commands;
    if ctx.message.server_id.is_some() && disabled.iter().any(|c| c.eq_ignore_ascii_case(&d.name)) {
        return Some(Forbidden::Disabled);
    }
    None
}

fn build_one(factory: &CommandFactory, category: &str) -> Result<Registered> {
    let command = factory()?;
    let mut descriptor = command.descriptor();
    descriptor.validate()?;
    descriptor.category = category.to_string();
    Ok(Registered {
        command,
        descriptor,
        factory: factory.clone(),
    })
}

async fn build_category(cat: &dyn CommandCategory) -> Result<(CategoryStats, Vec<Registered>)> {
    let started = Instant::now();
    let entries = cat.entries().await.map_err(|e| {
        tracing::error!(category = cat.name(), error = %e, "cannot list command category");
        e
    })?;

    let mut stats = CategoryStats {
        category: cat.name().to_string(),
        loaded: 0,
        skipped: 0,
        elapsed: Duration::ZERO,
    };
    let mut built = Vec::with_capacity(entries.len());
    for f in &entries {
        match build_one(f, cat.name()) {
            Ok(reg) => built.push(reg),
            Err(e) => {
                tracing::warn!(category = cat.name(), error = %e, "skipping invalid command entry");
                stats.skipped += 1;
            }
        }
    }
    stats.elapsed = started.elapsed();
    Ok((stats, built))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests;
