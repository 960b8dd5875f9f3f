//! Per-credential request budgets, enforced at the handler boundary.
//!
//! Buckets are keyed by `key_id`, not user: two keys of one user are
//! limited independently. Windowed counting over in-memory timestamp
//! vectors; state is per-process, which is exactly the blast radius of a
//! single-node control plane.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind};

/// Registry deployments per key per minute.
const REGISTRY_DEPLOYS_PER_MINUTE: usize = 5;
/// Git deployments per key per minute (builds are expensive).
const GIT_DEPLOYS_PER_MINUTE: usize = 3;

pub struct RateLimiter {
    max_attempts: usize,
    window: Duration,
    buckets: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt; `false` when the key is over budget.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let attempts = buckets.entry(key.to_string()).or_default();

        attempts.retain(|at| now.duration_since(*at) < self.window);
        if attempts.len() >= self.max_attempts {
            return false;
        }

        attempts.push(now);
        true
    }
}

/// The three budgets of the HTTP surface.
pub struct RateLimits {
    general: RateLimiter,
    registry_deploys: RateLimiter,
    git_deploys: RateLimiter,
}

impl RateLimits {
    pub fn new(general_limit: usize, general_window: Duration) -> Self {
        Self {
            general: RateLimiter::new(general_limit, general_window),
            registry_deploys: RateLimiter::new(
                REGISTRY_DEPLOYS_PER_MINUTE,
                Duration::from_secs(60),
            ),
            git_deploys: RateLimiter::new(GIT_DEPLOYS_PER_MINUTE, Duration::from_secs(60)),
        }
    }

    pub fn general(&self, key_id: &str) -> Result<(), Error> {
        gate(self.general.check(key_id))
    }

    pub fn registry_deploy(&self, key_id: &str) -> Result<(), Error> {
        gate(self.registry_deploys.check(key_id))
    }

    pub fn git_deploy(&self, key_id: &str) -> Result<(), Error> {
        gate(self.git_deploys.check(key_id))
    }
}

fn gate(allowed: bool) -> Result<(), Error> {
    if allowed {
        Ok(())
    } else {
        Err(Error::from_kind(ErrorKind::RateLimited))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_consumed_then_refused() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        assert!(limiter.check("key-a"));
        assert!(limiter.check("key-a"));
        assert!(limiter.check("key-a"));
        assert!(!limiter.check("key-a"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));

        assert!(limiter.check("key-a"));
        assert!(!limiter.check("key-a"));
        assert!(limiter.check("key-b"));
    }

    #[test]
    fn window_expiry_frees_budget() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));

        assert!(limiter.check("key-a"));
        assert!(!limiter.check("key-a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check("key-a"));
    }

    #[test]
    fn deploy_budgets_are_separate_from_general() {
        let limits = RateLimits::new(100, Duration::from_secs(60));

        for _ in 0..5 {
            limits.registry_deploy("key").unwrap();
        }
        assert!(limits.registry_deploy("key").is_err());
        // Git and general budgets are untouched.
        limits.git_deploy("key").unwrap();
        limits.general("key").unwrap();
    }
}
