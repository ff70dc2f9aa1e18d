//! Login protection lockout state machine, spec.md §4.8 / §8 S6.
//!
//! The `http.Flusher`/`http.Hijacker`-preserving response wrapper named in
//! spec.md §4.8 is HTTP-layer plumbing the embedding binary owns (out of
//! scope per spec.md §1); this module exposes only the lockout decision
//! the embedding layer calls into before and after checking credentials.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Attempt {
    consecutive_failures: u32,
    locked_until: Option<Instant>,
}

impl Default for Attempt {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            locked_until: None,
        }
    }
}

/// Locks a `(ip, username)` tuple after `threshold` consecutive failures
/// within the lockout `window`.
pub struct LoginGuard {
    threshold: u32,
    window: Duration,
    attempts: Mutex<HashMap<(String, String), Attempt>>,
}

impl LoginGuard {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Call before the credential check. Returns `Err` with the seconds
    /// remaining if the tuple is currently locked.
    pub fn check(&self, ip: &str, username: &str) -> Result<(), i64> {
        let key = (ip.to_string(), username.to_string());
        let attempts = self.attempts.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(attempt) = attempts.get(&key) {
            if let Some(locked_until) = attempt.locked_until {
                let now = Instant::now();
                if now < locked_until {
                    return Err((locked_until - now).as_secs() as i64);
                }
            }
        }
        Ok(())
    }

    /// Record a failed credential check; locks the tuple once
    /// `consecutive_failures` reaches `threshold`.
    pub fn record_failure(&self, ip: &str, username: &str) {
        let key = (ip.to_string(), username.to_string());
        let mut attempts = self.attempts.lock().unwrap_or_else(|p| p.into_inner());
        let entry = attempts.entry(key).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.threshold {
            entry.locked_until = Some(Instant::now() + self.window);
        }
    }

    /// Record a successful credential check; clears the tuple's history.
    pub fn record_success(&self, ip: &str, username: &str) {
        let key = (ip.to_string(), username.to_string());
        let mut attempts = self.attempts.lock().unwrap_or_else(|p| p.into_inner());
        attempts.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locks_after_threshold_consecutive_failures() {
        let guard = LoginGuard::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            guard.record_failure("1.2.3.4", "alice");
            assert!(guard.check("1.2.3.4", "alice").is_ok());
        }
        guard.record_failure("1.2.3.4", "alice");
        assert!(guard.check("1.2.3.4", "alice").is_err());
    }

    #[test]
    fn success_clears_failure_history() {
        let guard = LoginGuard::new(3, Duration::from_secs(60));
        guard.record_failure("1.2.3.4", "alice");
        guard.record_failure("1.2.3.4", "alice");
        guard.record_success("1.2.3.4", "alice");
        guard.record_failure("1.2.3.4", "alice");
        assert!(guard.check("1.2.3.4", "alice").is_ok());
    }

    #[test]
    fn lockout_is_scoped_to_the_exact_tuple() {
        let guard = LoginGuard::new(1, Duration::from_secs(60));
        guard.record_failure("1.2.3.4", "alice");
        assert!(guard.check("1.2.3.4", "bob").is_ok());
        assert!(guard.check("9.9.9.9", "alice").is_ok());
    }
}
