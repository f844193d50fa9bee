//! Exponential backoff with symmetric jitter.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

const DEFAULT_BASE_MS: u64 = 3_000;
const DEFAULT_GROWTH: f64 = 1.5;
const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
const DEFAULT_JITTER: f64 = 0.2;

/// Retry delay schedule.
///
/// `delay(n) = min(base * growth^n, max_delay)`, scaled by a uniform factor
/// in `[1 - jitter, 1 + jitter]` and floored to whole milliseconds. Early
/// retries stay fast, later ones are bounded, and the jitter keeps many
/// instances from retrying in lockstep.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub growth_factor: f64,
    pub max_delay_ms: u64,
    /// Fraction in `[0, 1]`.
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_BASE_MS,
            growth_factor: DEFAULT_GROWTH,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_fraction: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, mostly useful in tests.
    #[must_use]
    pub fn without_jitter(self) -> Self {
        Self {
            jitter_fraction: 0.0,
            ..self
        }
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    /// Same as [`next_delay`](Self::next_delay) with an explicit jitter source.
    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter = self.jitter();
        let factor = if jitter > 0.0 {
            rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        millis(self.capped_ms(attempt) * factor)
    }

    /// Inclusive `[min, max]` window `next_delay(attempt)` falls into.
    #[must_use]
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let capped = self.capped_ms(attempt);
        let jitter = self.jitter();
        (millis(capped * (1.0 - jitter)), millis(capped * (1.0 + jitter)))
    }

    /// Un-jittered delay in milliseconds.
    #[allow(clippy::cast_precision_loss)]
    fn capped_ms(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_ms as f64 * self.growth_factor.max(1.0).powi(exponent);
        raw.min(self.max_delay_ms as f64)
    }

    fn jitter(&self) -> f64 {
        self.jitter_fraction.clamp(0.0, 1.0)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn millis(ms: f64) -> Duration {
    Duration::from_millis(ms.floor().max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn test_default_constants() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_ms, 3_000);
        assert!((policy.growth_factor - 1.5).abs() < f64::EPSILON);
        assert_eq!(policy.max_delay_ms, 60_000);
        assert!((policy.jitter_fraction - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unjittered_sequence() {
        let policy = BackoffPolicy::default().without_jitter();
        let delays: Vec<u64> = (0..10)
            .map(|n| policy.next_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![3_000, 4_500, 6_750, 10_125, 15_187, 22_781, 34_171, 51_257, 60_000, 60_000]
        );
    }

    #[test]
    fn test_delay_within_bounds() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let ceiling = Duration::from_millis(72_000); // max_delay * (1 + jitter)

        for attempt in [0u32, 1, 2, 5, 8, 10, 20, 64, 1_000, u32::MAX] {
            let (lo, hi) = policy.bounds(attempt);
            assert!(hi <= ceiling);
            for _ in 0..200 {
                let d = policy.next_delay_with(attempt, &mut rng);
                assert!(d >= lo, "attempt {attempt}: {d:?} < {lo:?}");
                assert!(d <= hi, "attempt {attempt}: {d:?} > {hi:?}");
            }
        }
        assert_eq!(policy.bounds(0), (Duration::from_millis(2_400), Duration::from_millis(3_600)));
    }

    #[test]
    fn test_mean_non_decreasing_up_to_cap() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mean = |attempt: u32, rng: &mut StdRng| {
            let total: u128 = (0..2_000)
                .map(|_| policy.next_delay_with(attempt, rng).as_millis())
                .sum();
            total as f64 / 2_000.0
        };

        let mut previous = mean(0, &mut rng);
        for attempt in 1..14 {
            let current = mean(attempt, &mut rng);
            assert!(
                current >= previous * 0.98,
                "attempt {attempt}: mean {current} dropped below {previous}"
            );
            previous = current;
        }
        assert!(previous > 55_000.0 && previous < 65_000.0);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let policy: BackoffPolicy = serde_json::from_str(r#"{ "base_ms": 100 }"#).unwrap();
        assert_eq!(policy.base_ms, 100);
        assert_eq!(policy.max_delay_ms, 60_000);
    }
}
