// src/rabbitmq/reconnect.rs

use std::time::Duration;

/// How long the reconnect loop sleeps after a failed dial or a lost connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// The same delay every time.
    Fixed(Duration),
    /// Doubles per consecutive failure up to `max`, with +/- `jitter` (a fraction
    /// of the delay) applied to spread out reconnect storms.
    Exponential {
        initial: Duration,
        max: Duration,
        jitter: f64,
    },
}

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        ReconnectPolicy::Exponential {
            initial,
            max,
            jitter: 0.15,
        }
    }

    /// Delay before the next attempt, where `attempt` counts consecutive failures from 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            ReconnectPolicy::Fixed(delay) => *delay,
            ReconnectPolicy::Exponential {
                initial,
                max,
                jitter,
            } => {
                let base = initial
                    .checked_mul(2u32.saturating_pow(attempt.min(31)))
                    .unwrap_or(*max)
                    .min(*max);

                if *jitter <= 0.0 {
                    return base;
                }

                let spread = (rand::random::<f64>() * 2.0 - 1.0) * jitter;
                let jittered = base.as_secs_f64() * (1.0 + spread);
                Duration::from_secs_f64(jittered.max(0.0)).min(*max)
            }
        }
    }
}
