use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::Instant;

use crate::{dispatcher::command::RateLimitPolicy, domain::UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitState {
    pub usage: u32,
    pub reset_at: Instant,
    pub last_used: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { usage: u32 },
    Limited { remaining: Duration },
}

/// Fixed-window limiter keyed by (user, command). State is created lazily.
#[derive(Debug, Default)]
pub struct RateLimiter {
    states: Mutex<HashMap<(UserId, String), RateLimitState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(UserId, String), RateLimitState>> {
        self.states.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn check(&self, user: UserId, command: &str, policy: RateLimitPolicy) -> RateDecision {
        self.check_at(user, command, policy, Instant::now())
    }

    pub fn check_at(
        &self,
        user: UserId,
        command: &str,
        policy: RateLimitPolicy,
        now: Instant,
    ) -> RateDecision {
        let mut states = self.lock();
        let key = (user, command.to_string());

        match states.get_mut(&key) {
            Some(st) if now < st.reset_at => {
                if st.usage >= policy.max_uses {
                    return RateDecision::Limited {
                        remaining: st.reset_at - now,
                    };
                }
                st.usage += 1;
                st.last_used = now;
                RateDecision::Allowed { usage: st.usage }
            }
            _ => {
                states.insert(
                    key,
                    RateLimitState {
                        usage: 1,
                        reset_at: now + policy.window,
                        last_used: now,
                    },
                );
                RateDecision::Allowed { usage: 1 }
            }
        }
    }

    pub fn state(&self, user: UserId, command: &str) -> Option<RateLimitState> {
        self.lock().get(&(user, command.to_string())).copied()
    }

    /// Drop states whose window has closed. Returns how many were dropped.
    pub fn prune_at(&self, now: Instant) -> usize {
        let mut states = self.lock();
        let before = states.len();
        states.retain(|_, st| now < st.reset_at);
        before - states.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_uses: u32, secs: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            max_uses,
            window: Duration::from_secs(secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_call_past_limit_until_window_resets() {
        let rl = RateLimiter::new();
        let p = policy(3, 10);
        let user = UserId(1);

        for expected in 1..=3 {
            assert_eq!(
                rl.check(user, "ping", p),
                RateDecision::Allowed { usage: expected }
            );
        }

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            rl.check(user, "ping", p),
            RateDecision::Limited {
                remaining: Duration::from_secs(6)
            }
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(rl.check(user, "ping", p), RateDecision::Allowed { usage: 1 });
        assert_eq!(rl.state(user, "ping").unwrap().usage, 1);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let rl = RateLimiter::new();
        let now = Instant::now();
        let p = policy(1, 3);
        assert!(matches!(rl.check_at(UserId(1), "a", p, now), RateDecision::Allowed { .. }));
        assert!(matches!(rl.check_at(UserId(1), "b", p, now), RateDecision::Allowed { .. }));
        assert!(matches!(rl.check_at(UserId(2), "a", p, now), RateDecision::Allowed { .. }));
        assert!(matches!(rl.check_at(UserId(1), "a", p, now), RateDecision::Limited { .. }));
    }

    #[tokio::test]
    async fn prune_drops_closed_windows() {
        let rl = RateLimiter::new();
        let now = Instant::now();
        rl.check_at(UserId(1), "a", policy(1, 3), now);
        rl.check_at(UserId(2), "a", policy(1, 30), now);
        assert_eq!(rl.prune_at(now + Duration::from_secs(5)), 1);
        assert_eq!(rl.len(), 1);
    }
}
