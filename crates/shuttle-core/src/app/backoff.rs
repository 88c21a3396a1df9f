//! Exponential backoff with jitter for engine calls that failed.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay before the next attempt: the current step with up to half of it
    /// shaved off at random, then the step doubles (capped at `max`).
    pub fn next_delay(&mut self) -> Duration {
        let step = self.current;
        self.current = step.saturating_mul(2).min(self.max);

        let half = u64::try_from(step.as_millis() / 2).unwrap_or(u64::MAX);
        if half == 0 {
            return step;
        }
        let shave = rand::thread_rng().gen_range(0..=half);
        step.saturating_sub(Duration::from_millis(shave))
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));
        let delays: Vec<Duration> = (0..5).map(|_| b.next_delay()).collect();

        assert!(delays[0] >= Duration::from_millis(50) && delays[0] <= Duration::from_millis(100));
        assert!(delays[1] >= Duration::from_millis(100) && delays[1] <= Duration::from_millis(200));
        for d in &delays[2..] {
            assert!(*d >= Duration::from_millis(200) && *d <= Duration::from_millis(400));
        }
    }

    #[test]
    fn reset_starts_over() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        for _ in 0..6 {
            b.next_delay();
        }
        b.reset();
        assert!(b.next_delay() <= Duration::from_millis(10));
    }
}
