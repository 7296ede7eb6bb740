use rand::Rng;
use std::time::Duration;

/// Bounds and timings for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Window for the randomized wait after an invalid session.
    pub invalid_session_min: Duration,
    pub invalid_session_max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            invalid_session_min: Duration::from_secs(1),
            invalid_session_max: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Exponential delay for `attempt` (1-based), capped, with jitter in the upper half.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if ceiling.is_zero() {
            return ceiling;
        }
        let floor = ceiling / 2;
        rand::thread_rng().gen_range(floor..=ceiling)
    }

    pub fn invalid_session_delay(&self) -> Duration {
        if self.invalid_session_max <= self.invalid_session_min {
            return self.invalid_session_min;
        }
        rand::thread_rng().gen_range(self.invalid_session_min..=self.invalid_session_max)
    }
}

/// Attempt counter for one connection. Reset on every authenticated session.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count one attempt. `None` once the policy's bound is exceeded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.backoff(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            ..ReconnectPolicy::default()
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy();
        for _ in 0..50 {
            let first = p.backoff(1);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
            let second = p.backoff(2);
            assert!(second >= Duration::from_millis(100) && second <= Duration::from_millis(200));
            let capped = p.backoff(10);
            assert!(capped <= Duration::from_millis(250));
        }
    }

    #[test]
    fn attempts_are_bounded_and_resettable() {
        let mut state = ReconnectState::new(policy());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_none());
        assert_eq!(state.attempts(), 3);

        state.reset();
        assert!(state.next_delay().is_some());
        assert_eq!(state.attempts(), 1);
    }

    #[test]
    fn invalid_session_delay_stays_in_window() {
        let p = ReconnectPolicy::default();
        for _ in 0..50 {
            let d = p.invalid_session_delay();
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(5));
        }
    }
}
