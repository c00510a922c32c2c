//! Reconnect delay sequences with jitter
//!
//! The first delay is only the random additive (near-immediate), later delays
//! grow exponentially from one second and are capped by `max_delay_ms`.

use crate::config::BackoffSection;
use rand::Rng;

const MILLISECONDS_IN_SECOND: u64 = 1000;

/// Exponential backoff cursor with additive random jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    counter: u32,
    delay: u64,
    config: BackoffSection,
}

impl Backoff {
    /// Create a cursor with the default delay policy
    pub fn new() -> Self {
        Self::with_config(BackoffSection::default())
    }

    /// Create a cursor with a custom delay policy; the first delay is computed immediately
    pub fn with_config(config: BackoffSection) -> Self {
        let mut backoff = Self {
            counter: 0,
            delay: 0,
            config,
        };
        backoff.next();
        backoff
    }

    /// Current delay in milliseconds
    pub fn value(&self) -> u64 {
        self.delay
    }

    /// Number of delays computed so far
    pub fn attempt(&self) -> u32 {
        self.counter
    }

    /// Advance the cursor and recompute the delay
    pub fn next(&mut self) {
        if self.delay < self.config.max_delay_ms {
            let additive = rand::thread_rng().gen_range(0..=self.config.random_additive_max_ms);
            self.delay = if self.counter == 0 {
                additive
            } else {
                Self::base_delay(&self.config, self.counter)
                    .saturating_add(additive)
                    .min(self.config.max_delay_ms)
            };
        }

        self.counter += 1;
    }

    /// Return to the first-attempt state
    pub fn reset(&mut self) {
        self.counter = 0;
        self.delay = 0;
        self.next();
    }

    /// Deterministic part of the delay for a given attempt (pure function)
    pub fn base_delay(config: &BackoffSection, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }

        config
            .factor
            .checked_pow(attempt)
            .and_then(|growth| growth.checked_mul(MILLISECONDS_IN_SECOND))
            .unwrap_or(u64::MAX)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_delay_is_small() {
        let config = BackoffSection::default();
        let backoff = Backoff::with_config(config.clone());

        assert!(backoff.value() <= config.random_additive_max_ms);
        assert_eq!(backoff.attempt(), 1);
    }

    #[test]
    fn test_growth_sequence() {
        let config = BackoffSection::default();
        let mut backoff = Backoff::with_config(config.clone());

        backoff.next();
        assert!((2000..=3000).contains(&backoff.value()));

        backoff.next();
        assert!((4000..=5000).contains(&backoff.value()));

        backoff.next();
        assert!((8000..=9000).contains(&backoff.value()));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = BackoffSection::default();
        let mut backoff = Backoff::with_config(config.clone());

        for _ in 0..64 {
            backoff.next();
        }

        assert_eq!(backoff.value(), config.max_delay_ms);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let config = BackoffSection::default();
        let mut backoff = Backoff::with_config(config.clone());

        for _ in 0..5 {
            backoff.next();
        }
        backoff.reset();

        assert_eq!(backoff.attempt(), 1);
        assert!(backoff.value() <= config.random_additive_max_ms);
    }

    #[test]
    fn test_base_delay_overflow_saturates() {
        let config = BackoffSection::default();
        assert_eq!(Backoff::base_delay(&config, 200), u64::MAX);
    }

    proptest! {
        #[test]
        fn prop_delay_never_drops_below_previous_floor(steps in 1usize..40) {
            let config = BackoffSection::default();
            let mut backoff = Backoff::with_config(config.clone());
            let mut previous_floor = 0u64;

            for _ in 0..steps {
                backoff.next();
                let attempt = backoff.attempt() - 1;
                let floor = Backoff::base_delay(&config, attempt).min(config.max_delay_ms);

                prop_assert!(backoff.value() >= previous_floor);
                prop_assert!(backoff.value() >= floor);
                prop_assert!(backoff.value() <= config.max_delay_ms);
                previous_floor = floor;
            }
        }
    }
}
