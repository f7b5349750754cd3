// ── Engine: Rate Budget Tracker ────────────────────────────────────────────
// Per-credential accounting of requests, tokens, and credits.
//
// Two accounting regimes:
//   • Sliding windows (requests, tokens, prompt_tokens, completion_tokens) —
//     time-ordered samples summed over the trailing window.
//   • Calendar windows (credits) — capped token buckets refilled at UTC
//     period boundaries (:00 of the minute/hour, midnight, 1st of month).
//
// One tracker exists per (provider, credential) pair and is shared by every
// model binding that uses that credential under that provider, so usage
// aggregates where the upstream would see it aggregate. Limits are supplied
// per check from the binding's effective budget spec; the tracker itself
// only stores usage.
//
// All charge amounts arriving here are already multiplier-scaled by the
// provider instance: one real unit consumes M budget units.

use crate::atoms::constants::SLIDING_WINDOW_MAX_ENTRIES;
use crate::engine::clock::Clock;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

// ── Metrics and windows ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    Requests,
    Tokens,
    PromptTokens,
    CompletionTokens,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::Requests,
        Metric::Tokens,
        Metric::PromptTokens,
        Metric::CompletionTokens,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Metric::Requests => "requests",
            Metric::Tokens => "tokens",
            Metric::PromptTokens => "prompt_tokens",
            Metric::CompletionTokens => "completion_tokens",
        }
    }

    pub fn parse(s: &str) -> Option<Metric> {
        match s {
            "requests" => Some(Metric::Requests),
            "tokens" => Some(Metric::Tokens),
            "prompt_tokens" => Some(Metric::PromptTokens),
            "completion_tokens" => Some(Metric::CompletionTokens),
            _ => None,
        }
    }

    fn idx(self) -> usize {
        match self {
            Metric::Requests => 0,
            Metric::Tokens => 1,
            Metric::PromptTokens => 2,
            Metric::CompletionTokens => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WindowKind {
    Minute,
    Hour,
    Day,
    Month,
}

impl WindowKind {
    pub fn seconds(self) -> f64 {
        match self {
            WindowKind::Minute => 60.0,
            WindowKind::Hour => 3_600.0,
            WindowKind::Day => 86_400.0,
            WindowKind::Month => 2_592_000.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            WindowKind::Minute => "minute",
            WindowKind::Hour => "hour",
            WindowKind::Day => "day",
            WindowKind::Month => "month",
        }
    }

    pub fn parse(s: &str) -> Option<WindowKind> {
        match s {
            "minute" => Some(WindowKind::Minute),
            "hour" => Some(WindowKind::Hour),
            "day" => Some(WindowKind::Day),
            "month" => Some(WindowKind::Month),
            _ => None,
        }
    }

    /// Floor `t` to this window's UTC boundary.
    fn floor(self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            WindowKind::Minute => Utc
                .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), t.minute(), 0)
                .unwrap(),
            WindowKind::Hour => Utc
                .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
                .unwrap(),
            WindowKind::Day => Utc
                .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
                .unwrap(),
            WindowKind::Month => Utc
                .with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
                .unwrap(),
        }
    }

    /// The boundary strictly after `boundary` (which must itself be aligned).
    fn next_boundary(self, boundary: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            WindowKind::Minute => boundary + chrono::Duration::seconds(60),
            WindowKind::Hour => boundary + chrono::Duration::seconds(3_600),
            WindowKind::Day => boundary + chrono::Duration::seconds(86_400),
            WindowKind::Month => {
                let (y, m) = if boundary.month() == 12 {
                    (boundary.year() + 1, 1)
                } else {
                    (boundary.year(), boundary.month() + 1)
                };
                Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).unwrap()
            }
        }
    }
}

// ── Budget spec (effective limits) ─────────────────────────────────────────

/// The effective (metric, window) → limit map for one model-provider
/// binding, derived once at load time: provider defaults overlaid with the
/// binding's overrides.
#[derive(Debug, Clone, Default)]
pub struct BudgetSpec {
    pub limits: BTreeMap<(Metric, WindowKind), f64>,
}

impl BudgetSpec {
    /// Parse `"{metric}_per_{window}"` keys (e.g. `requests_per_minute`,
    /// `tokens_per_day`). Returns the offending key on failure.
    pub fn from_entries<'a, I>(entries: I) -> Result<BudgetSpec, String>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut limits = BTreeMap::new();
        for (key, limit) in entries {
            let (metric, window) = key
                .rsplit_once("_per_")
                .and_then(|(m, w)| Some((Metric::parse(m)?, WindowKind::parse(w)?)))
                .ok_or_else(|| key.to_string())?;
            if limit <= 0.0 {
                return Err(key.to_string());
            }
            limits.insert((metric, window), limit);
        }
        Ok(BudgetSpec { limits })
    }

    /// Provider defaults overlaid with binding overrides.
    pub fn merged(defaults: &BudgetSpec, overrides: &BudgetSpec) -> BudgetSpec {
        let mut limits = defaults.limits.clone();
        for (k, v) in &overrides.limits {
            limits.insert(*k, *v);
        }
        BudgetSpec { limits }
    }
}

// ── Charges ────────────────────────────────────────────────────────────────

/// The amount one attempt consumes of each budget, already multiplier-scaled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Charge {
    pub requests: f64,
    pub prompt_tokens: f64,
    pub completion_tokens: f64,
    pub credits: f64,
}

impl Charge {
    pub fn tokens(&self) -> f64 {
        self.prompt_tokens + self.completion_tokens
    }

    fn amount(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Requests => self.requests,
            Metric::Tokens => self.tokens(),
            Metric::PromptTokens => self.prompt_tokens,
            Metric::CompletionTokens => self.completion_tokens,
        }
    }
}

/// Credit pricing for one binding. Token operands are multiplier-scaled
/// before these rates apply; unconfigured terms are zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreditPricing {
    pub per_input_token: f64,
    pub per_output_token: f64,
    pub per_million_tokens: f64,
    pub per_request: f64,
}

impl CreditPricing {
    /// The part of the credit cost knowable before the call.
    pub fn request_cost(&self) -> f64 {
        self.per_request
    }

    /// The token-derived part, computed post-flight from actual usage.
    pub fn token_cost(&self, prompt_tokens: f64, completion_tokens: f64) -> f64 {
        prompt_tokens * self.per_input_token
            + completion_tokens * self.per_output_token
            + (prompt_tokens + completion_tokens) / 1_000_000.0 * self.per_million_tokens
    }
}

// ── Check decision ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allowed,
    Denied(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// The soonest-resolving limit that denied the charge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Denial {
    pub metric: &'static str,
    pub window: WindowKind,
    pub retry_after_secs: f64,
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} per {} budget exhausted, retry in {:.0}s",
            self.metric,
            self.window.label(),
            self.retry_after_secs
        )
    }
}

// ── Calendar credit windows ────────────────────────────────────────────────

/// Capped token bucket refilled by `gain` at every UTC boundary of its kind.
#[derive(Debug, Clone)]
pub struct CreditWindow {
    pub kind: WindowKind,
    pub gain: f64,
    pub max_balance: f64,
    pub balance: f64,
    /// UTC timestamp aligned to the window boundary of the last refill.
    pub last_reset: DateTime<Utc>,
}

impl CreditWindow {
    fn new(kind: WindowKind, gain: f64, max_balance: f64, now: DateTime<Utc>) -> Self {
        CreditWindow {
            kind,
            gain,
            max_balance,
            balance: max_balance,
            last_reset: kind.floor(now),
        }
    }

    /// Advance through every boundary elapsed since the last refill,
    /// crediting `gain` (capped) per boundary. Idempotent in the sense that
    /// advancing T→T' equals advancing T→T''→T' for any T'' in between.
    fn advance(&mut self, now: DateTime<Utc>) {
        match self.kind {
            // Fixed-length periods: whole elapsed periods in one step.
            WindowKind::Minute | WindowKind::Hour | WindowKind::Day => {
                let period = self.kind.seconds() as i64;
                let elapsed = (now - self.last_reset).num_seconds();
                if elapsed >= period {
                    let n = elapsed / period;
                    self.balance = (self.balance + self.gain * n as f64).min(self.max_balance);
                    self.last_reset += chrono::Duration::seconds(n * period);
                }
            }
            // Months are irregular: walk boundary by boundary.
            WindowKind::Month => {
                loop {
                    let next = self.kind.next_boundary(self.last_reset);
                    if next > now {
                        break;
                    }
                    self.balance = (self.balance + self.gain).min(self.max_balance);
                    self.last_reset = next;
                }
            }
        }
    }

    fn seconds_until_refill(&self, now: DateTime<Utc>) -> f64 {
        let next = self.kind.next_boundary(self.kind.floor(now));
        ((next - now).num_milliseconds() as f64 / 1_000.0).max(0.0)
    }
}

/// Configured accrual rates for one provider's credit windows.
#[derive(Debug, Clone, Default)]
pub struct CreditAccrual {
    /// (window, gain_per_period, max_balance) — max defaults to gain.
    pub windows: Vec<(WindowKind, f64, f64)>,
}

// ── Snapshot types ─────────────────────────────────────────────────────────

/// The non-reconstructable slice of tracker state: one entry per calendar
/// credit window. Sliding-window samples are ephemeral and not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditWindowState {
    pub balance: f64,
    /// Epoch seconds of the aligned last-reset boundary.
    pub last_reset_at: f64,
}

// ── The tracker ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: f64,
    amount: f64,
}

pub struct BudgetTracker {
    clock: Clock,
    /// One deque per metric, time-ordered, pruned to the widest window.
    usage: [VecDeque<Sample>; 4],
    credits: Vec<CreditWindow>,
}

impl BudgetTracker {
    pub fn new(clock: Clock, accrual: &CreditAccrual) -> Self {
        let now = clock.wall();
        let credits = accrual
            .windows
            .iter()
            .map(|&(kind, gain, max)| CreditWindow::new(kind, gain, max, now))
            .collect();
        BudgetTracker {
            clock,
            usage: Default::default(),
            credits,
        }
    }

    /// Atomic check-and-reserve: if every configured limit admits `charge`,
    /// commit it and return Allowed; otherwise commit nothing and return the
    /// soonest-resolving denial. Callers hold the tracker lock for the whole
    /// call, so two concurrent pre-flights cannot jointly overrun a limit.
    pub fn try_charge(&mut self, charge: &Charge, spec: &BudgetSpec) -> Decision {
        let decision = self.check(charge, spec);
        if decision.is_allowed() {
            self.commit(charge);
        }
        decision
    }

    /// Would `charge` fit right now? Read-only; used for pre-flight checks
    /// and the stats endpoint's `rate_limited` flag.
    pub fn check(&mut self, charge: &Charge, spec: &BudgetSpec) -> Decision {
        let now = self.clock.mono();
        self.prune(now);

        let mut soonest: Option<Denial> = None;
        let mut consider = |candidate: Denial| {
            let sooner = soonest
                .as_ref()
                .map(|d| candidate.retry_after_secs < d.retry_after_secs)
                .unwrap_or(true);
            if sooner {
                soonest = Some(candidate);
            }
        };

        for (&(metric, window), &limit) in &spec.limits {
            let amount = charge.amount(metric);
            let used = self.sum_window(metric, window, now);
            if used + amount > limit {
                consider(Denial {
                    metric: metric.label(),
                    window,
                    retry_after_secs: self.sliding_retry_after(metric, window, now),
                });
            }
        }

        let wall = self.clock.wall();
        for cw in &mut self.credits {
            cw.advance(wall);
            if cw.balance < charge.credits {
                let retry = cw.seconds_until_refill(wall);
                consider(Denial {
                    metric: "credits",
                    window: cw.kind,
                    retry_after_secs: retry,
                });
            }
        }

        match soonest {
            Some(denial) => Decision::Denied(denial),
            None => Decision::Allowed,
        }
    }

    /// Unconditionally record `charge`. Post-flight commits land here even
    /// when they would have been denied pre-flight — the cost is already
    /// paid, so the credit balance may go transiently negative.
    pub fn commit(&mut self, charge: &Charge) {
        let now = self.clock.mono();
        for metric in Metric::ALL {
            let amount = charge.amount(metric);
            if amount > 0.0 {
                self.usage[metric.idx()].push_back(Sample { at: now, amount });
            }
        }
        self.prune(now);

        if !self.credits.is_empty() {
            let wall = self.clock.wall();
            for cw in &mut self.credits {
                cw.advance(wall);
                cw.balance -= charge.credits;
            }
        }
    }

    /// Current usage of one (metric, window) pair. Exposed for the stats
    /// endpoint's per-limit `{used, limit}` view.
    pub fn usage_in(&mut self, metric: Metric, window: WindowKind) -> f64 {
        let now = self.clock.mono();
        self.prune(now);
        self.sum_window(metric, window, now)
    }

    pub fn credit_windows(&mut self) -> &[CreditWindow] {
        let wall = self.clock.wall();
        for cw in &mut self.credits {
            cw.advance(wall);
        }
        &self.credits
    }

    // ── Snapshot / restore ─────────────────────────────────────────────────

    /// Credit balances and reset timestamps only — sliding samples are
    /// reconstructable noise and stay ephemeral.
    pub fn snapshot(&self) -> BTreeMap<String, CreditWindowState> {
        self.credits
            .iter()
            .map(|cw| {
                (
                    cw.kind.label().to_string(),
                    CreditWindowState {
                        balance: cw.balance,
                        last_reset_at: cw.last_reset.timestamp() as f64,
                    },
                )
            })
            .collect()
    }

    /// Best-effort restore: windows present in the snapshot get their balance
    /// and reset point back; elapsed boundaries refill on the next check.
    pub fn restore(&mut self, saved: &BTreeMap<String, CreditWindowState>) {
        for cw in &mut self.credits {
            if let Some(state) = saved.get(cw.kind.label()) {
                cw.balance = state.balance;
                if let Some(t) = Utc.timestamp_opt(state.last_reset_at as i64, 0).single() {
                    cw.last_reset = cw.kind.floor(t);
                }
            }
        }
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn sum_window(&self, metric: Metric, window: WindowKind, now: f64) -> f64 {
        let cutoff = now - window.seconds();
        self.usage[metric.idx()]
            .iter()
            .rev()
            .take_while(|s| s.at > cutoff)
            .map(|s| s.amount)
            .sum()
    }

    /// When does usage in this window next decrease? The expiry of the
    /// oldest surviving sample; a whole window if nothing is recorded yet.
    fn sliding_retry_after(&self, metric: Metric, window: WindowKind, now: f64) -> f64 {
        let cutoff = now - window.seconds();
        self.usage[metric.idx()]
            .iter()
            .find(|s| s.at > cutoff)
            .map(|s| s.at + window.seconds() - now)
            .unwrap_or_else(|| window.seconds())
    }

    /// Expire samples older than the widest window and enforce the bounded
    /// tail. Entries are appended in time order, so the front is the oldest.
    fn prune(&mut self, now: f64) {
        let cutoff = now - WindowKind::Month.seconds();
        for deque in &mut self.usage {
            while deque.front().is_some_and(|s| s.at <= cutoff) {
                deque.pop_front();
            }
            while deque.len() > SLIDING_WINDOW_MAX_ENTRIES {
                deque.pop_front();
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_clock() -> Clock {
        Clock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap())
    }

    fn spec(entries: &[(&str, f64)]) -> BudgetSpec {
        BudgetSpec::from_entries(entries.iter().map(|&(k, v)| (k, v))).unwrap()
    }

    fn request_charge() -> Charge {
        Charge { requests: 1.0, ..Default::default() }
    }

    #[test]
    fn spec_key_parsing() {
        let s = spec(&[("requests_per_minute", 2.0), ("tokens_per_day", 1000.0)]);
        assert_eq!(s.limits.len(), 2);
        assert!(BudgetSpec::from_entries([("bogus_per_minute", 1.0)]).is_err());
        assert!(BudgetSpec::from_entries([("requests_per_fortnight", 1.0)]).is_err());
        assert!(BudgetSpec::from_entries([("requests_per_minute", 0.0)]).is_err());
    }

    #[test]
    fn spec_merge_overrides_defaults() {
        let defaults = spec(&[("requests_per_minute", 10.0), ("tokens_per_day", 1000.0)]);
        let overrides = spec(&[("requests_per_minute", 2.0)]);
        let merged = BudgetSpec::merged(&defaults, &overrides);
        assert_eq!(merged.limits[&(Metric::Requests, WindowKind::Minute)], 2.0);
        assert_eq!(merged.limits[&(Metric::Tokens, WindowKind::Day)], 1000.0);
    }

    #[test]
    fn sliding_window_denies_then_expires() {
        let clock = test_clock();
        let mut tracker = BudgetTracker::new(clock.clone(), &CreditAccrual::default());
        let s = spec(&[("requests_per_minute", 2.0)]);

        assert!(tracker.try_charge(&request_charge(), &s).is_allowed());
        assert!(tracker.try_charge(&request_charge(), &s).is_allowed());
        let denied = tracker.try_charge(&request_charge(), &s);
        match denied {
            Decision::Denied(d) => {
                assert_eq!(d.metric, "requests");
                assert_eq!(d.window, WindowKind::Minute);
                assert!(d.retry_after_secs > 0.0 && d.retry_after_secs <= 60.0);
            }
            Decision::Allowed => panic!("third request should be denied"),
        }

        // Past the window, the samples expire and the charge fits again.
        clock.advance(61.0);
        assert!(tracker.try_charge(&request_charge(), &s).is_allowed());
    }

    #[test]
    fn denied_charge_is_not_recorded() {
        let clock = test_clock();
        let mut tracker = BudgetTracker::new(clock, &CreditAccrual::default());
        let s = spec(&[("requests_per_minute", 1.0)]);

        assert!(tracker.try_charge(&request_charge(), &s).is_allowed());
        assert!(!tracker.try_charge(&request_charge(), &s).is_allowed());
        assert_eq!(tracker.usage_in(Metric::Requests, WindowKind::Minute), 1.0);
    }

    #[test]
    fn token_metrics_share_samples_with_tokens_total() {
        let clock = test_clock();
        let mut tracker = BudgetTracker::new(clock, &CreditAccrual::default());
        tracker.commit(&Charge {
            prompt_tokens: 30.0,
            completion_tokens: 21.0,
            ..Default::default()
        });
        assert_eq!(tracker.usage_in(Metric::Tokens, WindowKind::Day), 51.0);
        assert_eq!(tracker.usage_in(Metric::PromptTokens, WindowKind::Day), 30.0);
        assert_eq!(tracker.usage_in(Metric::CompletionTokens, WindowKind::Day), 21.0);
    }

    #[test]
    fn postflight_commit_may_overshoot_then_denies() {
        let clock = test_clock();
        let mut tracker = BudgetTracker::new(clock, &CreditAccrual::default());
        let s = spec(&[("tokens_per_day", 100_000.0)]);

        // 51k raw tokens at 2.0 multiplier = 102k counted — commit succeeds.
        tracker.commit(&Charge {
            prompt_tokens: 60_000.0,
            completion_tokens: 42_000.0,
            ..Default::default()
        });
        assert_eq!(tracker.usage_in(Metric::Tokens, WindowKind::Day), 102_000.0);

        // Subsequent pre-flight with any token amount is denied.
        let next = Charge { prompt_tokens: 1.0, ..Default::default() };
        assert!(!tracker.check(&next, &s).is_allowed());
    }

    #[test]
    fn soonest_resolving_denial_wins() {
        let clock = test_clock();
        let mut tracker = BudgetTracker::new(clock.clone(), &CreditAccrual::default());
        let s = spec(&[("requests_per_minute", 1.0), ("requests_per_day", 1.0)]);

        assert!(tracker.try_charge(&request_charge(), &s).is_allowed());
        match tracker.check(&request_charge(), &s) {
            Decision::Denied(d) => {
                // Minute resolves long before day.
                assert_eq!(d.window, WindowKind::Minute);
            }
            Decision::Allowed => panic!("should be denied"),
        }
    }

    #[test]
    fn bounded_tail_cap_engages() {
        let clock = test_clock();
        let mut tracker = BudgetTracker::new(clock.clone(), &CreditAccrual::default());
        for _ in 0..(SLIDING_WINDOW_MAX_ENTRIES + 100) {
            tracker.commit(&request_charge());
            clock.advance(0.001);
        }
        assert_eq!(
            tracker.usage_in(Metric::Requests, WindowKind::Month),
            SLIDING_WINDOW_MAX_ENTRIES as f64
        );
    }

    // ── Calendar credit windows ────────────────────────────────────────────

    fn minute_accrual(gain: f64, max: f64) -> CreditAccrual {
        CreditAccrual { windows: vec![(WindowKind::Minute, gain, max)] }
    }

    #[test]
    fn credit_bucket_denies_when_short_and_refills_on_boundary() {
        // Scenario: gain 10/min, max 10, 4 credits per request.
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let mut tracker = BudgetTracker::new(clock.clone(), &minute_accrual(10.0, 10.0));
        let s = BudgetSpec::default();
        let charge = Charge { requests: 1.0, credits: 4.0, ..Default::default() };

        assert!(tracker.try_charge(&charge, &s).is_allowed());
        assert!(tracker.try_charge(&charge, &s).is_allowed()); // balance 2

        clock.advance(10.0);
        match tracker.check(&charge, &s) {
            Decision::Denied(d) => {
                assert_eq!(d.metric, "credits");
                assert_eq!(d.window, WindowKind::Minute);
                assert!((d.retry_after_secs - 50.0).abs() < 0.01);
            }
            Decision::Allowed => panic!("2 credits cannot cover a 4-credit charge"),
        }

        // At the next :00 boundary the bucket refills to max.
        clock.advance(50.0);
        assert!(tracker.try_charge(&charge, &s).is_allowed());
    }

    #[test]
    fn credit_refill_is_capped() {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let mut tracker = BudgetTracker::new(clock.clone(), &minute_accrual(10.0, 15.0));
        tracker.commit(&Charge { credits: 12.0, ..Default::default() }); // balance 3

        clock.advance(600.0); // ten boundaries
        let windows = tracker.credit_windows();
        assert_eq!(windows[0].balance, 15.0); // capped at max, not 103
    }

    #[test]
    fn credit_refill_is_idempotent_over_split_advances() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        let one_jump = Clock::manual(start);
        let mut a = BudgetTracker::new(one_jump.clone(), &minute_accrual(3.0, 100.0));
        a.commit(&Charge { credits: 90.0, ..Default::default() });
        one_jump.advance(300.0);

        let stepped = Clock::manual(start);
        let mut b = BudgetTracker::new(stepped.clone(), &minute_accrual(3.0, 100.0));
        b.commit(&Charge { credits: 90.0, ..Default::default() });
        for _ in 0..30 {
            stepped.advance(10.0);
            b.credit_windows();
        }

        assert_eq!(a.credit_windows()[0].balance, b.credit_windows()[0].balance);
    }

    #[test]
    fn negative_balance_blocks_until_refill() {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let mut tracker = BudgetTracker::new(clock.clone(), &minute_accrual(5.0, 10.0));
        let s = BudgetSpec::default();

        // Post-flight overshoot: balance 10 − 14 = −4.
        tracker.commit(&Charge { credits: 14.0, ..Default::default() });
        let zero_credit = Charge { requests: 1.0, ..Default::default() };
        assert!(!tracker.check(&zero_credit, &s).is_allowed());

        // One refill (+5) brings it to 1 ≥ 0 — zero-credit charges pass.
        clock.advance(60.0);
        assert!(tracker.check(&zero_credit, &s).is_allowed());
    }

    #[test]
    fn month_window_walks_irregular_boundaries() {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 0).unwrap());
        let accrual = CreditAccrual { windows: vec![(WindowKind::Month, 100.0, 100.0)] };
        let mut tracker = BudgetTracker::new(clock.clone(), &accrual);
        tracker.commit(&Charge { credits: 100.0, ..Default::default() }); // balance 0

        // Cross the Feb 1 boundary.
        clock.advance(60.0 + 86_400.0);
        assert_eq!(tracker.credit_windows()[0].balance, 100.0);
    }

    #[test]
    fn snapshot_round_trips_credit_state() {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let mut tracker = BudgetTracker::new(clock.clone(), &minute_accrual(10.0, 10.0));
        tracker.commit(&Charge { credits: 7.5, ..Default::default() });

        let snap = tracker.snapshot();
        let mut restored = BudgetTracker::new(clock, &minute_accrual(10.0, 10.0));
        restored.restore(&snap);
        assert_eq!(restored.credit_windows()[0].balance, 2.5);
        assert_eq!(
            restored.credit_windows()[0].last_reset,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn credit_pricing_formula() {
        let pricing = CreditPricing {
            per_input_token: 0.001,
            per_output_token: 0.002,
            per_million_tokens: 500.0,
            per_request: 4.0,
        };
        assert_eq!(pricing.request_cost(), 4.0);
        // 1000·0.001 + 500·0.002 + (1500/1e6)·500 = 1 + 1 + 0.75
        assert!((pricing.token_cost(1_000.0, 500.0) - 2.75).abs() < 1e-9);
    }
}
