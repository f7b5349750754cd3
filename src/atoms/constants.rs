// ── Atoms: Constants ───────────────────────────────────────────────────────
// All named tuning constants for the dispatch engine live here.
// Collecting them in one place eliminates magic numbers and makes the
// failure-handling policy auditable at a glance.

// ── Key rotation ───────────────────────────────────────────────────────────
// A key that fails this many times in a row is benched for the cooldown
// period, then re-enabled with a clean slate.
pub const KEY_DISABLE_THRESHOLD: u32 = 3;
pub const KEY_COOLDOWN_SECS: f64 = 600.0;

// ── Circuit breaker ────────────────────────────────────────────────────────
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const BREAKER_SUCCESS_THRESHOLD: u32 = 2;
pub const BREAKER_OPEN_SECS: f64 = 60.0;

// ── Retry backoff ──────────────────────────────────────────────────────────
// delay(attempt) = min(BASE * 2^attempt, CAP), slept between retries on the
// same provider instance.
pub const BACKOFF_BASE_SECS: f64 = 1.0;
pub const BACKOFF_CAP_SECS: f64 = 300.0;

// ── Budget windows ─────────────────────────────────────────────────────────
// Per-metric sliding windows keep at most this many samples.  When the cap
// engages the oldest sample is dropped and usage becomes approximate —
// an intentional memory/accuracy trade-off for very high request rates.
pub const SLIDING_WINDOW_MAX_ENTRIES: usize = 4_000;

// ── Metrics ────────────────────────────────────────────────────────────────
/// Capacity of the per-instance response-time ring buffer (avg / p95 source).
pub const RESPONSE_WINDOW_CAPACITY: usize = 100;

// ── Request handling defaults ──────────────────────────────────────────────
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: f64 = 60.0;

// ── Process lifecycle ──────────────────────────────────────────────────────
/// Periodic metrics snapshot flush interval.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60;
/// Bounded wait for in-flight requests to drain on shutdown.
pub const SHUTDOWN_DRAIN_SECS: u64 = 10;
