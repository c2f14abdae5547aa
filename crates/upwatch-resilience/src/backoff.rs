//! ---
//! upw_section: "07-resilience-fault-tolerance"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Exponential reconnect backoff with jitter."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Policy parameters controlling reconnect delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the second attempt; doubles on every further failure.
    pub base_delay: Duration,
    /// Upper bound for the exponential part of the delay.
    pub max_delay: Duration,
    /// Maximum jitter added to each delay to avoid thundering herds.
    pub jitter: Duration,
}

impl BackoffPolicy {
    /// Construct a policy; `max_delay` is raised to `base_delay` if smaller.
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter,
        }
    }

    /// Calculate the delay for the provided attempt (1-indexed) with exponential growth.
    pub fn delay_for(&self, attempt: u32, rng: &mut StdRng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(60),
            Duration::from_millis(250),
        )
    }
}

/// Stateful backoff: counts consecutive failures until [`Backoff::reset`].
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    /// Create a backoff tracker seeded from OS entropy.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Seed the internal RNG for deterministic testing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay_for(self.attempt, &mut self.rng)
    }

    /// Consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.attempt
    }

    /// Forget previous failures after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
