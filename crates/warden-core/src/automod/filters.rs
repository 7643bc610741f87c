use regex::Regex;

use crate::{
    chat::ChatMessage,
    persistence::model::{AutomodConfig, ViolationKind},
    Error, Result,
};

/// One detected violation, before it is turned into a stored record.
#[derive(Clone, Debug, PartialEq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub details: String,
}

impl Violation {
    fn new(kind: ViolationKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            details: details.into(),
        }
    }
}

/// Content filters (mentions, caps, links, invites). Compiled once.
#[derive(Debug)]
pub struct ContentFilters {
    url: Regex,
    invite: Regex,
}

impl ContentFilters {
    pub fn new() -> Result<Self> {
        Ok(Self {
            url: compile(r"(?i)\b(?:https?://|www\.)([a-z0-9](?:[a-z0-9.-]*[a-z0-9])?\.[a-z]{2,})")?,
            invite: compile(
                r"(?i)\b(?:discord(?:app)?\.com/invite|discord\.gg|t\.me/(?:joinchat/|\+))/?[a-z0-9_-]+",
            )?,
        })
    }

    /// Run every enabled content filter over `msg`.
    pub fn check(&self, msg: &ChatMessage, cfg: &AutomodConfig) -> Vec<Violation> {
        let mut out = Vec::new();

        if cfg.mentions.enabled && msg.mention_count > cfg.mentions.max_mentions {
            out.push(Violation::new(
                ViolationKind::Mentions,
                format!("{} mentions (max {})", msg.mention_count, cfg.mentions.max_mentions),
            ));
        }

        if cfg.caps.enabled {
            if let Some(ratio) = caps_ratio(&msg.content, cfg.caps.min_length) {
                if ratio > cfg.caps.max_ratio {
                    out.push(Violation::new(
                        ViolationKind::Caps,
                        format!("{:.0}% capitals", ratio * 100.0),
                    ));
                }
            }
        }

        let invites: Vec<&str> = self
            .invite
            .find_iter(&msg.content)
            .map(|m| m.as_str())
            .collect();
        if cfg.invites.enabled && !invites.is_empty() {
            out.push(Violation::new(ViolationKind::Invites, invites.join(", ")));
        }

        if cfg.links.enabled {
            // Invite links are the invite filter's business.
            let scanned = if cfg.invites.enabled {
                self.invite.replace_all(&msg.content, "")
            } else {
                std::borrow::Cow::Borrowed(msg.content.as_str())
            };
            let blocked: Vec<String> = self
                .url
                .captures_iter(&scanned)
                .filter_map(|c| c.get(1))
                .map(|host| host.as_str().to_ascii_lowercase())
                .filter(|host| !domain_allowed(host, &cfg.links.allowed_domains))
                .collect();
            if !blocked.is_empty() {
                out.push(Violation::new(ViolationKind::Links, blocked.join(", ")));
            }
        }

        out
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Init(format!("invalid filter pattern: {e}")))
}

/// Uppercase share among letters, or `None` when the message is too short to judge.
fn caps_ratio(text: &str, min_length: usize) -> Option<f64> {
    if text.chars().count() <= min_length {
        return None;
    }
    let (letters, upper) = text
        .chars()
        .filter(|c| c.is_alphabetic())
        .fold((0usize, 0usize), |(l, u), c| (l + 1, u + usize::from(c.is_uppercase())));
    if letters == 0 {
        return None;
    }
    Some(upper as f64 / letters as f64)
}

fn domain_allowed(host: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|d| {
        let d = d.trim().trim_start_matches('.').to_ascii_lowercase();
        !d.is_empty() && (host == d || host.ends_with(&format!(".{d}")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::message;

    fn cfg() -> AutomodConfig {
        let mut cfg = AutomodConfig::default();
        cfg.enabled = true;
        cfg.links.enabled = true;
        cfg.links.allowed_domains = vec!["example.com".into()];
        cfg
    }

    fn kinds(v: &[Violation]) -> Vec<ViolationKind> {
        v.iter().map(|v| v.kind).collect()
    }

    #[test]
    fn caps_only_checked_above_min_length() {
        let f = ContentFilters::new().unwrap();
        assert!(f.check(&message(1, 1, 1, "HELLO"), &cfg()).is_empty());
        assert_eq!(
            kinds(&f.check(&message(1, 1, 1, "STOP SHOUTING AT ME"), &cfg())),
            vec![ViolationKind::Caps]
        );
        assert!(f.check(&message(1, 1, 1, "1234567890123 !!"), &cfg()).is_empty());
    }

    #[test]
    fn mentions_over_limit() {
        let f = ContentFilters::new().unwrap();
        let mut msg = message(1, 1, 1, "hi all");
        msg.mention_count = 6;
        assert_eq!(kinds(&f.check(&msg, &cfg())), vec![ViolationKind::Mentions]);
        msg.mention_count = 5;
        assert!(f.check(&msg, &cfg()).is_empty());
    }

    #[test]
    fn links_respect_allow_list_suffixes() {
        let f = ContentFilters::new().unwrap();
        let ok = message(1, 1, 1, "see https://docs.example.com/page and www.example.com");
        assert!(f.check(&ok, &cfg()).is_empty());

        let bad = f.check(&message(1, 1, 1, "buy at http://notexample.com now"), &cfg());
        assert_eq!(kinds(&bad), vec![ViolationKind::Links]);
        assert_eq!(bad[0].details, "notexample.com");
    }

    #[test]
    fn invites_are_flagged_once() {
        let f = ContentFilters::new().unwrap();
        let v = f.check(&message(1, 1, 1, "join https://discord.gg/abc123"), &cfg());
        assert_eq!(kinds(&v), vec![ViolationKind::Invites]);

        let v = f.check(&message(1, 1, 1, "t.me/+AbCdEf and t.me/joinchat/xyz"), &cfg());
        assert_eq!(kinds(&v), vec![ViolationKind::Invites]);
    }

    #[test]
    fn disabled_filters_stay_quiet() {
        let f = ContentFilters::new().unwrap();
        let mut c = cfg();
        c.invites.enabled = false;
        c.links.enabled = false;
        c.caps.enabled = false;
        let msg = message(1, 1, 1, "JOIN HTTPS://DISCORD.GG/ABC NOW PLEASE");
        assert!(f.check(&msg, &c).is_empty());
    }
}
