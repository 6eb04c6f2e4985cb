//! Health gates: decide when a waiting state is done.
//!
//! Both functions are pure: they look at prober snapshots and the clock
//! supplied by the caller, and never touch infrastructure.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use cutover_core::config::MAX_POLICY_DURATION;

use cutover_health::HealthSnapshot;
use cutover_state::HealthPolicy;

/// Outcome of looking at one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Keep waiting.
    Pending,
    Pass,
    Fail(String),
}

/// AWAITING_HEALTH: green passes once the prober reports a full
/// evaluation window at the required healthy fraction.
pub fn awaiting_health(snapshot: Option<&HealthSnapshot>, policy: &HealthPolicy) -> Verdict {
    match snapshot {
        Some(s) if s.meets(policy) => Verdict::Pass,
        _ => Verdict::Pending,
    }
}

/// POST_SHIFT_VERIFY: counts cycles after the convergence window.
///
/// `baseline` is the last cycle seen when the grace period ended. A
/// snapshot whose streak is shorter than the cycles elapsed since the
/// baseline proves a failing cycle happened, even if the mailbox dropped
/// the snapshot that showed it.
#[derive(Debug, Clone, Copy)]
pub struct VerifyWindow {
    baseline: u64,
    window: u32,
}

impl VerifyWindow {
    pub fn new(baseline: u64, window: u32) -> Self {
        Self { baseline, window }
    }

    pub fn judge(&self, snapshot: &HealthSnapshot) -> Verdict {
        if snapshot.cycle <= self.baseline {
            return Verdict::Pending;
        }
        let since = snapshot.cycle - self.baseline;
        if u64::from(snapshot.consecutive_success_cycles) < since {
            return Verdict::Fail(format!(
                "green regressed after traffic shift: {}/{} healthy at cycle {}",
                snapshot.healthy_count, snapshot.total_count, snapshot.cycle
            ));
        }
        if since >= u64::from(self.window) {
            Verdict::Pass
        } else {
            Verdict::Pending
        }
    }
}

/// What is left of `budget` for a state entered at `entered_at`.
///
/// Measured on the wall clock so a resumed deployment keeps the time it
/// already spent.
pub fn remaining(entered_at: DateTime<Utc>, budget: Duration) -> Duration {
    let elapsed = (Utc::now() - entered_at).to_std().unwrap_or_default();
    budget.saturating_sub(elapsed)
}

/// Clock instant at which `budget`, counted from `entered_at`, runs out.
///
/// Budgets beyond [`MAX_POLICY_DURATION`] (records written before the
/// bound existed) are clamped.
pub fn deadline(entered_at: DateTime<Utc>, budget: Duration) -> Instant {
    let now = Instant::now();
    let left = remaining(entered_at, budget).min(MAX_POLICY_DURATION);
    now.checked_add(left).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cycle: u64, healthy: u32, total: u32, consecutive: u32) -> HealthSnapshot {
        HealthSnapshot {
            task_set_id: "green".to_string(),
            healthy_count: healthy,
            total_count: total,
            consecutive_success_cycles: consecutive,
            cycle,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn awaiting_needs_full_window() {
        let policy = HealthPolicy::default();
        assert_eq!(awaiting_health(None, &policy), Verdict::Pending);
        assert_eq!(awaiting_health(Some(&snapshot(2, 3, 3, 2)), &policy), Verdict::Pending);
        assert_eq!(awaiting_health(Some(&snapshot(3, 3, 3, 3)), &policy), Verdict::Pass);
        assert_eq!(awaiting_health(Some(&snapshot(9, 2, 3, 0)), &policy), Verdict::Pending);
    }

    #[test]
    fn awaiting_honors_fraction() {
        let policy = HealthPolicy {
            min_healthy_fraction: 0.6,
            ..HealthPolicy::default()
        };
        assert_eq!(awaiting_health(Some(&snapshot(3, 2, 3, 3)), &policy), Verdict::Pass);
    }

    #[test]
    fn verify_passes_after_window() {
        let window = VerifyWindow::new(10, 3);
        assert_eq!(window.judge(&snapshot(10, 3, 3, 10)), Verdict::Pending);
        assert_eq!(window.judge(&snapshot(11, 3, 3, 11)), Verdict::Pending);
        assert_eq!(window.judge(&snapshot(13, 3, 3, 13)), Verdict::Pass);
    }

    #[test]
    fn verify_fails_on_failing_cycle() {
        let window = VerifyWindow::new(10, 3);
        assert!(matches!(window.judge(&snapshot(11, 1, 3, 0)), Verdict::Fail(_)));
    }

    #[test]
    fn verify_detects_missed_failure() {
        // Cycles 11..=13 elapsed but the streak is only one long: cycle 12
        // failed and the mailbox coalesced it away.
        let window = VerifyWindow::new(10, 3);
        assert!(matches!(window.judge(&snapshot(13, 3, 3, 1)), Verdict::Fail(_)));
    }

    #[test]
    fn verify_ignores_failures_before_baseline() {
        // The streak restarted during the grace period; only cycles after
        // the baseline count.
        let window = VerifyWindow::new(10, 2);
        assert_eq!(window.judge(&snapshot(12, 3, 3, 2)), Verdict::Pass);
    }

    #[test]
    fn remaining_budget_shrinks() {
        let budget = Duration::from_secs(60);
        let now = Utc::now();
        assert!(remaining(now, budget) <= budget);
        let long_ago = now - chrono::Duration::seconds(120);
        assert_eq!(remaining(long_ago, budget), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_clamps_huge_budgets() {
        let start = Instant::now();
        let at = deadline(Utc::now(), Duration::from_secs(u64::MAX));
        assert!(at > start);
        assert!(at - start <= MAX_POLICY_DURATION);
    }
}
