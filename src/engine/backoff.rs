// ── Engine: Retry Backoff ──────────────────────────────────────────────────
// Exponential delay between retries on the same provider instance:
// delay(attempt) = min(base · 2^attempt, cap). No jitter — delays must be
// monotonically non-decreasing up to the cap.

use crate::atoms::constants::{BACKOFF_BASE_SECS, BACKOFF_CAP_SECS};

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_secs: f64,
    cap_secs: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base_secs: BACKOFF_BASE_SECS,
            cap_secs: BACKOFF_CAP_SECS,
        }
    }
}

impl Backoff {
    pub fn new(base_secs: f64, cap_secs: f64) -> Self {
        Backoff { base_secs, cap_secs }
    }

    /// Delay before retry `attempt` (0-based). The exponent is clamped so
    /// large attempt counts cannot overflow into infinity before the cap
    /// applies.
    pub fn delay_secs(&self, attempt: u32) -> f64 {
        let factor = 2f64.powi(attempt.min(32) as i32);
        (self.base_secs * factor).min(self.cap_secs)
    }
}
