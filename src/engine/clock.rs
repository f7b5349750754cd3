// ── Engine: Clock ──────────────────────────────────────────────────────────
// Single injectable monotonic + wall-clock pair.
//
// Calendar credit boundaries use the wall clock (UTC); sliding windows,
// cooldowns, and backoff use monotonic seconds. The manual variant lets
// tests advance both deterministically — `sleep` on a manual clock advances
// time and returns immediately, so backoff-heavy scenarios run in
// microseconds instead of real minutes.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct Clock {
    inner: ClockInner,
}

#[derive(Clone)]
enum ClockInner {
    System { start: Instant },
    Manual(Arc<Mutex<ManualTime>>),
}

struct ManualTime {
    /// Monotonic seconds since clock creation.
    mono: f64,
    wall: DateTime<Utc>,
}

impl Clock {
    /// The real clock: monotonic from process start, wall from the OS.
    pub fn system() -> Self {
        Clock { inner: ClockInner::System { start: Instant::now() } }
    }

    /// A test clock frozen at `wall`, advanced only by `advance`/`sleep`.
    pub fn manual(wall: DateTime<Utc>) -> Self {
        Clock {
            inner: ClockInner::Manual(Arc::new(Mutex::new(ManualTime { mono: 0.0, wall }))),
        }
    }

    /// Monotonic seconds since clock creation.
    pub fn mono(&self) -> f64 {
        match &self.inner {
            ClockInner::System { start } => start.elapsed().as_secs_f64(),
            ClockInner::Manual(t) => t.lock().mono,
        }
    }

    /// Current UTC wall time.
    pub fn wall(&self) -> DateTime<Utc> {
        match &self.inner {
            ClockInner::System { .. } => Utc::now(),
            ClockInner::Manual(t) => t.lock().wall,
        }
    }

    /// Wall time as fractional epoch seconds, for snapshot timestamps.
    pub fn epoch(&self) -> f64 {
        let wall = self.wall();
        wall.timestamp() as f64 + f64::from(wall.timestamp_subsec_millis()) / 1_000.0
    }

    /// Advance a manual clock by `secs` (both monotonic and wall).
    /// No effect on the system clock.
    pub fn advance(&self, secs: f64) {
        if let ClockInner::Manual(t) = &self.inner {
            let mut t = t.lock();
            t.mono += secs;
            t.wall += ChronoDuration::milliseconds((secs * 1_000.0) as i64);
        }
    }

    /// Sleep for `secs`. On a manual clock this advances time and returns
    /// immediately.
    pub async fn sleep(&self, secs: f64) {
        match &self.inner {
            ClockInner::System { .. } => tokio::time::sleep(Duration::from_secs_f64(secs)).await,
            ClockInner::Manual(_) => self.advance(secs),
        }
    }
}
