use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;

/// Attempt timestamps per key, kept in process memory.
#[derive(Clone)]
pub struct SlidingWindow {
    attempts: Arc<DashMap<String, VecDeque<Instant>>>,
    active: bool,
}

impl SlidingWindow {
    pub fn new(active: bool) -> Self {
        Self { attempts: Arc::new(DashMap::new()), active }
    }

    /// Counts an attempt against `key`. Refuses once `limit` earlier attempts are younger than `window`.
    pub fn admit(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.active {
            return true;
        }
        let now = Instant::now();
        let mut seen = self.attempts.entry(key.to_owned()).or_default();
        let cutoff = seen.iter().take_while(|at| now.duration_since(**at) >= window).count();
        seen.drain(..cutoff);
        let admitted = seen.len() < limit;
        if admitted {
            seen.push_back(now);
        }
        admitted
    }

    pub fn forget(&self, key: &str) {
        self.attempts.remove(key);
    }
}

#[derive(Clone, Debug)]
pub struct LoginThrottleConfig {
    pub limit: usize,
    pub window: Duration,
}

impl Default for LoginThrottleConfig {
    fn default() -> Self {
        Self { limit: 10, window: Duration::from_secs(300) }
    }
}

impl LoginThrottleConfig {
    pub fn from_env() -> Self {
        let num = |name: &str| std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok());
        let d = Self::default();
        Self {
            limit: num("RL_LOGIN_LIMIT").map_or(d.limit, |n| n as usize),
            window: num("RL_LOGIN_WINDOW").map_or(d.window, Duration::from_secs),
        }
    }
}

/// Per-identifier login attempt guard used by the auth handlers.
#[derive(Clone)]
pub struct LoginThrottle {
    window: SlidingWindow,
    cfg: LoginThrottleConfig,
}

impl LoginThrottle {
    pub fn new(cfg: LoginThrottleConfig) -> Self {
        Self { window: SlidingWindow::new(cfg.limit > 0), cfg }
    }

    pub fn disabled() -> Self {
        Self { window: SlidingWindow::new(false), cfg: LoginThrottleConfig::default() }
    }

    fn key(scope: &str, identifier: &str) -> String {
        format!("{scope}:{}", identifier.trim().to_lowercase())
    }

    pub fn allow(&self, scope: &str, identifier: &str) -> bool {
        self.window.admit(&Self::key(scope, identifier), self.cfg.limit, self.cfg.window)
    }

    /// Clears the window after a successful login.
    pub fn succeeded(&self, scope: &str, identifier: &str) {
        self.window.forget(&Self::key(scope, identifier));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn attempts_expire_after_the_window() {
        let w = SlidingWindow::new(true);
        let window = Duration::from_millis(30);
        for _ in 0..3 { assert!(w.admit("k", 3, window)); }
        assert!(!w.admit("k", 3, window));
        std::thread::sleep(Duration::from_millis(40));
        assert!(w.admit("k", 3, window));
    }

    #[test]
    fn identifiers_are_case_folded_and_reset_on_success() {
        let t = LoginThrottle::new(LoginThrottleConfig { limit: 2, window: Duration::from_secs(60) });
        assert!(t.allow("staff", "Admin"));
        assert!(t.allow("staff", "admin "));
        assert!(!t.allow("staff", "ADMIN"));
        assert!(t.allow("parent", "admin"));
        t.succeeded("staff", "admin");
        assert!(t.allow("staff", "admin"));
    }

    #[test]
    fn disabled_throttle_never_limits() {
        let t = LoginThrottle::disabled();
        for _ in 0..50 { assert!(t.allow("staff", "x")); }
    }
}
