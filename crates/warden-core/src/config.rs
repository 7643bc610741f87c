use std::{env, fs, path::Path, time::Duration};

use crate::{
    domain::UserId,
    errors::Error,
    resilience::{BreakerConfig, RetryPolicy},
    Result,
};

/// Typed process-level configuration.
///
/// Per-server settings live in [`crate::persistence::ServerConfig`]; this struct only
/// holds what the process needs before any server is known.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub bot_token: Option<String>,
    pub owners: Vec<UserId>,
    pub database_url: String,
    pub default_prefix: String,

    // Persistence
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub batch_debounce: Duration,
    pub batch_max_delay: Duration,
    pub batch_flush_interval: Duration,
    pub batch_max_pending: usize,

    // Resilience
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub request_timeout: Duration,

    // Dispatcher
    pub command_cache_ttl: Duration,
    pub rate_limit_sweep_interval: Duration,

    // Automod
    pub history_ttl: Duration,
    pub history_sweep_interval: Duration,
}

const DEFAULT_DATABASE_URL: &str = "sqlite://warden.db";
const DEFAULT_PREFIX: &str = "!";

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_token: None,
            owners: Vec::new(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            default_prefix: DEFAULT_PREFIX.to_string(),
            cache_ttl: Duration::from_secs(300),
            cache_sweep_interval: Duration::from_secs(60),
            batch_debounce: Duration::from_millis(250),
            batch_max_delay: Duration::from_millis(2000),
            batch_flush_interval: Duration::from_secs(5),
            batch_max_pending: 500,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            request_timeout: Duration::from_millis(15_000),
            command_cache_ttl: Duration::from_secs(30),
            rate_limit_sweep_interval: Duration::from_secs(120),
            history_ttl: Duration::from_secs(600),
            history_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load from the process environment, after applying an optional `.env` file.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            Ok(parse_num::<u64>(key, get(key))?
                .map(Duration::from_secs)
                .unwrap_or(default))
        };
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            Ok(parse_num::<u64>(key, get(key))?
                .map(Duration::from_millis)
                .unwrap_or(default))
        };
        let count = |key: &str, default: u32| -> Result<u32> {
            Ok(parse_num::<u32>(key, get(key))?.unwrap_or(default).max(1))
        };

        let d = Self::default();

        let default_prefix = get("DEFAULT_PREFIX").unwrap_or(d.default_prefix);
        if default_prefix.chars().any(char::is_whitespace) {
            return Err(Error::Config(
                "DEFAULT_PREFIX must not contain whitespace".to_string(),
            ));
        }

        let retry = RetryPolicy {
            max_attempts: count("RETRY_MAX_ATTEMPTS", d.retry.max_attempts)?,
            base_delay: millis("RETRY_BASE_DELAY_MS", d.retry.base_delay)?,
            max_delay: millis("RETRY_MAX_DELAY_MS", d.retry.max_delay)?,
        };

        let breaker = BreakerConfig {
            failure_threshold: count("BREAKER_FAILURE_THRESHOLD", d.breaker.failure_threshold)?,
            cooldown: secs("BREAKER_COOLDOWN_SECS", d.breaker.cooldown)?,
            success_threshold: count("BREAKER_SUCCESS_THRESHOLD", d.breaker.success_threshold)?,
        };

        Ok(Self {
            bot_token: get("WARDEN_BOT_TOKEN"),
            owners: parse_csv_i64(get("WARDEN_OWNERS"))
                .into_iter()
                .map(UserId)
                .collect(),
            database_url: get("DATABASE_URL").unwrap_or(d.database_url),
            default_prefix,
            cache_ttl: secs("CACHE_TTL_SECS", d.cache_ttl)?,
            cache_sweep_interval: secs("CACHE_SWEEP_SECS", d.cache_sweep_interval)?,
            batch_debounce: millis("BATCH_DEBOUNCE_MS", d.batch_debounce)?,
            batch_max_delay: millis("BATCH_MAX_DELAY_MS", d.batch_max_delay)?,
            batch_flush_interval: secs("BATCH_FLUSH_INTERVAL_SECS", d.batch_flush_interval)?,
            batch_max_pending: parse_num::<usize>("BATCH_MAX_PENDING", get("BATCH_MAX_PENDING"))?
                .unwrap_or(d.batch_max_pending)
                .max(1),
            retry,
            breaker,
            request_timeout: millis("REQUEST_TIMEOUT_MS", d.request_timeout)?,
            command_cache_ttl: secs("COMMAND_CACHE_TTL_SECS", d.command_cache_ttl)?,
            rate_limit_sweep_interval: secs(
                "RATE_LIMIT_SWEEP_SECS",
                d.rate_limit_sweep_interval,
            )?,
            history_ttl: secs("HISTORY_TTL_SECS", d.history_ttl)?,
            history_sweep_interval: secs("HISTORY_SWEEP_SECS", d.history_sweep_interval)?,
        })
    }

    /// The bot token, required by transport adapters.
    pub fn require_token(&self) -> Result<&str> {
        self.bot_token.as_deref().ok_or_else(|| {
            Error::Config("WARDEN_BOT_TOKEN environment variable is required".to_string())
        })
    }

    pub fn is_owner(&self, user: UserId) -> bool {
        self.owners.contains(&user)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got '{raw}'")))
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
