//! Fibonacci/golden-ratio reconnection backoff (spec.md §4.9), grounded on
//! `internal/backoff/backoff.go`.

use std::time::Duration;

const GOLDEN_RATIO: f64 = 1.618_033_988_749_895;
const CAP_SECS: f64 = 180.0;

/// Per-task reconnect delay sequence: 0, 1, φ, φ², …, capped at 180s. A
/// successful operation resets the sequence.
#[derive(Default)]
pub struct Backoff {
    consecutive_errors: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// `consecutive_errors` is already incremented for the failure that
    /// triggered this delay, so the exponent counts the errors *before* it:
    /// the 2nd overall retry (1 prior error) sleeps `φ^0 = 1s`, the 3rd
    /// (2 prior errors) sleeps `φ^1`, and so on — the spec's own sequence
    /// "0, 1, φ, φ², …".
    fn delay(&self) -> Duration {
        let secs = GOLDEN_RATIO.powi(self.consecutive_errors as i32 - 2);
        Duration::from_secs_f64(secs.min(CAP_SECS))
    }

    /// Record a failure and sleep the appropriate delay before the caller
    /// retries. The first call after a reset sleeps zero (spec.md: "retry
    /// #1 after 0.0 seconds").
    pub async fn record_failure(&mut self) {
        self.consecutive_errors += 1;
        if self.consecutive_errors == 1 {
            tracing::warn!("retry #1 after 0.0 seconds");
            return;
        }
        let delay = self.delay();
        tracing::warn!(
            "retry #{} after {:.1} seconds",
            self.consecutive_errors,
            delay.as_secs_f64()
        );
        tokio::time::sleep(delay).await;
    }

    /// Reset the consecutive-error count after a successful operation.
    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_nondecreasing_until_cap() {
        let mut b = Backoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            b.consecutive_errors += 1;
            let d = b.delay();
            assert!(d >= last || d.as_secs_f64() == CAP_SECS);
            last = d;
        }
    }

    #[test]
    fn cap_is_respected() {
        let mut b = Backoff::new();
        b.consecutive_errors = 100;
        assert_eq!(b.delay(), Duration::from_secs_f64(CAP_SECS));
    }

    #[tokio::test]
    async fn success_resets_sequence() {
        let mut b = Backoff::new();
        b.record_failure().await;
        b.record_failure().await;
        assert_eq!(b.consecutive_errors, 2);
        b.record_success();
        assert_eq!(b.consecutive_errors, 0);
    }
}
