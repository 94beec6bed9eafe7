/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Capped exponential requeue delay with symmetric jitter.

use common::setting::ControllerSettings;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    /// Fraction of the delay applied as +/- random jitter.
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_settings(settings: &ControllerSettings) -> Self {
        Self::new(
            settings.backoff_base(),
            settings.backoff_cap(),
            settings.backoff_jitter,
        )
    }

    /// `min(base * 2^attempt, cap)` without jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Delay before retry number `attempt` (zero based), jittered and kept
    /// within `[0, cap]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter == 0.0 {
            return ceiling;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        let secs = ceiling.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(secs.clamp(0.0, self.cap.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(10), 0.0);
        assert_eq!(backoff.ceiling(0), Duration::from_millis(500));
        assert_eq!(backoff.ceiling(1), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(3), Duration::from_secs(4));
        assert_eq!(backoff.ceiling(5), Duration::from_secs(10));
        assert_eq!(backoff.ceiling(200), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.2);
        for _ in 0..200 {
            let d = backoff.delay(2);
            assert!(d >= Duration::from_millis(3200), "{d:?}");
            assert!(d <= Duration::from_millis(4800), "{d:?}");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 1.0);
        for _ in 0..200 {
            assert!(backoff.delay(10) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_from_settings() {
        let backoff = Backoff::from_settings(&ControllerSettings::default());
        assert_eq!(backoff.ceiling(0), Duration::from_millis(500));
        assert_eq!(backoff.ceiling(30), Duration::from_secs(300));
    }
}
