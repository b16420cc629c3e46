use std::cmp::min;
use std::time::Duration;
use rand::Rng;
use crate::config::NonBreakingConfig;

/// Delay between rejoin attempts, growing by a configured factor (in eighths) up to a maximum.
pub struct ExponentialBackoff {
    next_delay: Duration,

    config_max_delay: Duration,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(config: &NonBreakingConfig) -> Self {
        let result = ExponentialBackoff {
            next_delay: config.rejoin_initial_backoff,
            config_max_delay: config.rejoin_max_backoff,
            config_factor_eighths: config.rejoin_backoff_factor_eighths,
        };

        assert!(result.config_factor_eighths >= 8);

        result
    }

    /// Registers a failed attempt and returns the delay before the next one, without jitter
    pub fn next_delay(&mut self) -> Duration {
        let result = self.next_delay;
        self.next_delay = min(
            self.next_delay * self.config_factor_eighths / 8,
            self.config_max_delay,
        );
        result
    }

    /// adds up to 1/8 of random jitter to [ExponentialBackoff::next_delay] so that many connections
    ///  that broke at the same time don't rejoin in lockstep
    pub fn next_delay_with_jitter(&mut self) -> Duration {
        let delay = self.next_delay();
        let max_jitter_micros = (delay.as_micros() / 8) as u64;
        if max_jitter_micros == 0 {
            return delay;
        }
        delay + Duration::from_micros(rand::thread_rng().gen_range(0..max_jitter_micros))
    }
}
