//! Reconnection backoff: 1 s initial, doubling to a 60 s cap, with a little
//! jitter so a fleet of clients does not stampede the relay.

use std::time::Duration;

use rand::Rng;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);
const MAX_JITTER_MS: u64 = 250;

pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: INITIAL_DELAY,
        }
    }

    /// A successful session resets the schedule.
    pub fn reset(&mut self) {
        self.current = INITIAL_DELAY;
    }

    /// Delay before the next attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(MAX_DELAY);
        base + jitter()
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..MAX_JITTER_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_of(delay: Duration) -> Duration {
        // Strip jitter: delays are exact seconds plus up to 250 ms.
        Duration::from_secs(delay.as_secs())
    }

    #[test]
    fn schedule_doubles_to_cap() {
        let mut backoff = Backoff::new();
        let expected = [1u64, 2, 4, 8, 16, 32, 60, 60, 60];
        for seconds in expected {
            let delay = backoff.next_delay();
            assert_eq!(base_of(delay), Duration::from_secs(seconds));
            assert!(delay - base_of(delay) < Duration::from_millis(MAX_JITTER_MS));
        }
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(base_of(backoff.next_delay()), Duration::from_secs(1));
    }
}
