use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ChannelId, MessageId, RoleId, ServerId, UserId};

// ============== Server Configuration ==============

/// Per-server settings. Every nested field always has a value: rows loaded from the
/// store go through [`ServerConfig::from_stored`], which back-fills anything missing
/// or malformed from defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub prefix: String,
    pub owners: Vec<UserId>,
    pub features: FeatureToggles,
    pub security: SecurityLists,
    pub automod: AutomodConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureToggles {
    pub economy: bool,
    pub moderation: bool,
    pub automod: bool,
    pub fun: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityLists {
    pub blocked_users: Vec<UserId>,
    pub disabled_commands: Vec<String>,
    pub disabled_channels: Vec<ChannelId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomodConfig {
    pub enabled: bool,
    pub spam: SpamFilter,
    pub mentions: MentionFilter,
    pub caps: CapsFilter,
    pub links: LinkFilter,
    pub invites: InviteFilter,
    pub actions: AutomodActions,
    pub whitelist: Whitelist,
    pub log_channel: Option<ChannelId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamFilter {
    pub enabled: bool,
    /// Messages allowed inside the window before a burst violation.
    pub threshold: u32,
    pub window_secs: u64,
    /// Flag three or more messages inside the window as rapid repeats.
    pub rapid_repeat: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MentionFilter {
    pub enabled: bool,
    pub max_mentions: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsFilter {
    pub enabled: bool,
    /// Uppercase share of letters above which a message is flagged.
    pub max_ratio: f64,
    /// Messages of this many characters or fewer are never checked.
    pub min_length: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkFilter {
    pub enabled: bool,
    pub allowed_domains: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InviteFilter {
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomodActions {
    pub delete_message: bool,
    pub warn: bool,
    pub log_violation: bool,
    /// Time out on every violation, not only on escalation.
    pub timeout: bool,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Whitelist {
    pub users: Vec<UserId>,
    pub channels: Vec<ChannelId>,
    pub roles: Vec<RoleId>,
}

pub const DEFAULT_PREFIX: &str = "!";

impl Default for ServerConfig {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            economy: true,
            moderation: true,
            automod: true,
            fun: true,
        }
    }
}

impl Default for AutomodConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            spam: SpamFilter::default(),
            mentions: MentionFilter::default(),
            caps: CapsFilter::default(),
            links: LinkFilter::default(),
            invites: InviteFilter::default(),
            actions: AutomodActions::default(),
            whitelist: Whitelist::default(),
            log_channel: None,
        }
    }
}

impl Default for SpamFilter {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            window_secs: 10,
            rapid_repeat: true,
        }
    }
}

impl Default for MentionFilter {
    fn default() -> Self {
        Self {
            enabled: true,
            max_mentions: 5,
        }
    }
}

impl Default for CapsFilter {
    fn default() -> Self {
        Self {
            enabled: true,
            max_ratio: 0.7,
            min_length: 10,
        }
    }
}

impl Default for LinkFilter {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_domains: Vec::new(),
        }
    }
}

impl Default for InviteFilter {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for AutomodActions {
    fn default() -> Self {
        Self {
            delete_message: true,
            warn: true,
            log_violation: true,
            timeout: false,
            timeout_secs: 300,
        }
    }
}

impl ServerConfig {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            owners: Vec::new(),
            features: FeatureToggles::default(),
            security: SecurityLists::default(),
            automod: AutomodConfig::default(),
        }
    }

    /// Decode a stored row, degrading field by field to `defaults`.
    ///
    /// Returns the config and whether anything had to be back-filled.
    pub fn from_stored(stored: Value, defaults: &ServerConfig) -> (Self, bool) {
        let mut out = lenient_decode(stored, defaults);
        if out.0.prefix.trim().is_empty() || out.0.prefix.chars().any(char::is_whitespace) {
            out.0.prefix = defaults.prefix.clone();
            out.1 = true;
        }
        out
    }

    pub fn is_owner(&self, user: UserId) -> bool {
        self.owners.contains(&user)
    }
}

/// Overlay `stored` onto the serialized `defaults`, then drop any leaf that still
/// fails to decode. Never fails.
fn lenient_decode<T>(stored: Value, defaults: &T) -> (T, bool)
where
    T: Serialize + DeserializeOwned + Clone,
{
    let Ok(base) = serde_json::to_value(defaults) else {
        return (defaults.clone(), true);
    };

    let (mut merged, mut degraded) = overlay(base.clone(), stored);
    if let Ok(v) = serde_json::from_value::<T>(merged.clone()) {
        return (v, degraded);
    }

    // Find leaves that cannot decode even on their own and reset them.
    let mut paths = Vec::new();
    leaf_paths(&merged, &mut Vec::new(), &mut paths);
    for path in paths {
        let (Some(value), Some(default)) = (get_path(&merged, &path), get_path(&base, &path))
        else {
            continue;
        };
        if value == default {
            continue;
        }
        let mut probe = base.clone();
        if let Some(slot) = get_path_mut(&mut probe, &path) {
            *slot = value.clone();
        }
        if serde_json::from_value::<T>(probe).is_err() {
            let default = default.clone();
            if let Some(slot) = get_path_mut(&mut merged, &path) {
                *slot = default;
                degraded = true;
            }
        }
    }

    match serde_json::from_value::<T>(merged) {
        Ok(v) => (v, degraded),
        Err(_) => (defaults.clone(), true),
    }
}

fn overlay(default: Value, stored: Value) -> (Value, bool) {
    match (default, stored) {
        (Value::Object(mut d), Value::Object(mut s)) => {
            let mut degraded = false;
            for (key, slot) in d.iter_mut() {
                match s.remove(key) {
                    Some(sv) => {
                        let (v, deg) = overlay(std::mem::take(slot), sv);
                        *slot = v;
                        degraded |= deg;
                    }
                    None => degraded = true,
                }
            }
            (Value::Object(d), degraded)
        }
        // Optional fields: anything goes, decoding decides.
        (Value::Null, s) => (s, false),
        (d, s) if same_kind(&d, &s) => (s, false),
        (d, _) => (d, true),
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

fn leaf_paths(v: &Value, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    match v {
        Value::Object(map) => {
            for (k, child) in map {
                prefix.push(k.clone());
                leaf_paths(child, prefix, out);
                prefix.pop();
            }
        }
        _ => out.push(prefix.clone()),
    }
}

fn get_path<'a>(v: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(v, |cur, k| cur.get(k))
}

fn get_path_mut<'a>(v: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    path.iter().try_fold(v, |cur, k| cur.get_mut(k))
}

// ============== Economy ==============

/// Per-user wallet. `total` always equals `balance + bank` once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EconomyAccount {
    pub user_id: UserId,
    pub balance: i64,
    pub bank: i64,
    pub last_daily: Option<DateTime<Utc>>,
    pub last_work: Option<DateTime<Utc>>,
    pub work_streak: u32,
    pub inventory: BTreeMap<String, u32>,
    pub total: i64,
}

impl EconomyAccount {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: 0,
            bank: 0,
            last_daily: None,
            last_work: None,
            work_streak: 0,
            inventory: BTreeMap::new(),
            total: 0,
        }
    }

    /// Re-establish `total == balance + bank`.
    pub fn normalize(&mut self) {
        self.total = self.balance.saturating_add(self.bank);
    }

    pub fn is_consistent(&self) -> bool {
        self.balance.checked_add(self.bank) == Some(self.total)
    }

    /// Whether `balance + bank` fits in an `i64`.
    pub fn total_fits(&self) -> bool {
        self.balance.checked_add(self.bank).is_some()
    }
}

// ============== Violations ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Spam,
    RapidRepeat,
    Mentions,
    Caps,
    Links,
    Invites,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::Spam => "spam",
            ViolationKind::RapidRepeat => "rapid_repeat",
            ViolationKind::Mentions => "mentions",
            ViolationKind::Caps => "caps",
            ViolationKind::Links => "links",
            ViolationKind::Invites => "invites",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "spam" => ViolationKind::Spam,
            "rapid_repeat" => ViolationKind::RapidRepeat,
            "mentions" => ViolationKind::Mentions,
            "caps" => ViolationKind::Caps,
            "links" => ViolationKind::Links,
            "invites" => ViolationKind::Invites,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only moderation audit entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub kind: ViolationKind,
    pub server_id: ServerId,
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub message_id: Option<MessageId>,
    pub timestamp: DateTime<Utc>,
    pub details: String,
}

/// A violation as read back from the store.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredViolation {
    pub id: i64,
    pub record: ViolationRecord,
}
