//! Exponential backoff with full jitter, as an explicit retry state machine.
//!
//! Time is passed in rather than read, so the schedule runs unchanged under
//! tokio's paused test clock.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crm_common::config::{Jitter, RetryPolicy};

/// Delay generator for successive retries
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic jitter for tests
    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self {
            policy,
            attempt: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Delay before the next retry; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.policy.ceiling(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        match self.policy.jitter {
            Jitter::None => ceiling,
            Jitter::Full => {
                let max_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(self.rng.gen_range(0..=max_ms))
            }
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Where a retrying operation currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Waiting { attempt: u32, until: Instant },
    Exhausted { attempts: u32 },
}

/// What the caller should do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// Bounded retry schedule: `max_attempts` consecutive failures exhaust it
#[derive(Debug)]
pub struct RetrySchedule {
    backoff: Backoff,
    max_attempts: u32,
    failures: u32,
    state: RetryState,
}

impl RetrySchedule {
    pub fn new(policy: RetryPolicy, max_attempts: u32) -> Self {
        Self::from_backoff(Backoff::new(policy), max_attempts)
    }

    pub fn from_backoff(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
            failures: 0,
            state: RetryState::Idle,
        }
    }

    /// Record a failed attempt made at `now`
    pub fn on_failure(&mut self, now: Instant) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_attempts {
            self.state = RetryState::Exhausted {
                attempts: self.failures,
            };
            return RetryDecision::Exhausted {
                attempts: self.failures,
            };
        }
        let delay = self.backoff.next_delay();
        self.state = RetryState::Waiting {
            attempt: self.failures,
            until: now + delay,
        };
        RetryDecision::Retry {
            attempt: self.failures,
            delay,
        }
    }

    /// Record a successful attempt; the next failure starts from the base delay
    pub fn on_success(&mut self) {
        self.reset();
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.backoff.reset();
        self.state = RetryState::Idle;
    }

    #[must_use]
    pub fn state(&self) -> RetryState {
        self.state
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Cool-down after exhaustion before another round of attempts
    #[must_use]
    pub fn cool_down(&self) -> Duration {
        self.backoff.policy().max_delay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: Jitter) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter,
        }
    }

    #[test]
    fn test_exponential_without_jitter() {
        let mut backoff = Backoff::new(policy(Jitter::None));
        let delays: Vec<u64> = (0..8)
            .map(|_| u64::try_from(backoff.next_delay().as_millis()).unwrap())
            .collect();
        assert_eq!(
            delays,
            vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
    }

    #[test]
    fn test_full_jitter_stays_under_ceiling() {
        let p = policy(Jitter::Full);
        let mut backoff = Backoff::with_seed(p.clone(), 7);
        for attempt in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= p.ceiling(attempt), "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn test_seeded_jitter_is_deterministic() {
        let mut a = Backoff::with_seed(policy(Jitter::Full), 42);
        let mut b = Backoff::with_seed(policy(Jitter::Full), 42);
        for _ in 0..10 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }

    #[test]
    fn test_schedule_exhausts_after_bound() {
        let mut schedule = RetrySchedule::from_backoff(Backoff::new(policy(Jitter::None)), 3);
        let now = Instant::now();

        assert_eq!(
            schedule.on_failure(now),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(500)
            }
        );
        assert_eq!(
            schedule.state(),
            RetryState::Waiting {
                attempt: 1,
                until: now + Duration::from_millis(500)
            }
        );
        assert_eq!(
            schedule.on_failure(now),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_millis(1_000)
            }
        );
        assert_eq!(
            schedule.on_failure(now),
            RetryDecision::Exhausted { attempts: 3 }
        );
        assert_eq!(schedule.state(), RetryState::Exhausted { attempts: 3 });
    }

    #[test]
    fn test_success_resets_schedule() {
        let mut schedule = RetrySchedule::from_backoff(Backoff::new(policy(Jitter::None)), 5);
        let now = Instant::now();
        schedule.on_failure(now);
        schedule.on_failure(now);
        schedule.on_success();
        assert_eq!(schedule.state(), RetryState::Idle);
        assert_eq!(schedule.failures(), 0);
        assert_eq!(
            schedule.on_failure(now),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(500)
            }
        );
    }
}
