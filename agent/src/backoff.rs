//! Reconnect backoff: exponential with "equal jitter".
//!
//! For attempt `n` the ceiling is `d = min(cap, base * 2^n)` and the delay is
//! drawn from `[d/2, d]`, so a fleet that lost the hub at the same moment
//! spreads its reconnects instead of arriving in one wave.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
        }
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the delay for `attempt`.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay before the next attempt, using the thread RNG.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let half = ceiling / 2;
        let spread = u64::try_from((ceiling - half).as_millis()).unwrap_or(u64::MAX);
        half + Duration::from_millis(rng.gen_range(0..=spread))
    }

    /// Back to the base delay; called once a session reaches Ready.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    #[test]
    fn ceiling_doubles_then_caps() {
        let b = backoff();
        assert_eq!(b.ceiling(0), Duration::from_secs(1));
        assert_eq!(b.ceiling(1), Duration::from_secs(2));
        assert_eq!(b.ceiling(5), Duration::from_secs(32));
        assert_eq!(b.ceiling(6), Duration::from_secs(60));
        assert_eq!(b.ceiling(200), Duration::from_secs(60));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut b = backoff();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            b.next_delay_with(&mut rng);
        }
        assert_eq!(b.attempt(), 10);
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert!(b.next_delay_with(&mut rng) <= Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn delay_stays_within_half_ceiling_and_ceiling(
            seed in any::<u64>(),
            base_ms in 1u64..5_000,
            cap_s in 1u64..600,
            attempts in 0usize..80,
        ) {
            let mut b = Backoff::new(Duration::from_millis(base_ms), Duration::from_secs(cap_s));
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..attempts {
                b.next_delay_with(&mut rng);
            }
            let ceiling = b.ceiling(b.attempt());
            let delay = b.next_delay_with(&mut rng);
            prop_assert!(delay >= ceiling / 2);
            prop_assert!(delay <= ceiling);
            prop_assert!(ceiling <= Duration::from_secs(cap_s).max(Duration::from_millis(base_ms)));
        }
    }
}
