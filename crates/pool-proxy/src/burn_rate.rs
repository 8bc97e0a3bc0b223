//! Burn-Rate Calculator: a pure function from a snapshot history to a
//! consumption rate, ETA to exhaustion, and a status label. No I/O, no
//! mutable state — callers fetch the relevant window from the Snapshot
//! Store and hand it in.

use chrono::{DateTime, Duration, Utc};

use crate::snapshot_store::QuotaSnapshot;

/// How fast an account's quota for one family is being consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct BurnRate {
    /// Percentage-points consumed per hour; `None` while still calculating.
    pub rate_per_hour: Option<f64>,
    /// Hours until the quota hits zero at the current rate.
    pub hours_to_exhaustion: Option<f64>,
    /// Coarse classification for display.
    pub status: BurnStatus,
}

/// Burn-rate status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurnStatus {
    /// Quota is being consumed.
    Burning,
    /// Consumption is flat.
    Stable,
    /// Quota is increasing (recently reset, or server-side grant).
    Recovering,
    /// Quota has hit zero.
    Exhausted,
    /// Not enough history yet to produce a number.
    Calculating,
}

const MIN_HISTORY_AGE: Duration = Duration::seconds(60);
const NOISE_CAP_PCT_PER_HOUR: f64 = 100.0;
const RESET_JUMP_THRESHOLD_PCT: f64 = 30.0;
const DEFAULT_WINDOW: Duration = Duration::hours(24);

/// Compute the burn rate for one `(account, family)` at `now`, given the
/// full set of snapshots the caller already fetched for a wide-enough
/// window (callers typically pass `snapshotsSince(now - 24h)` and let this
/// function narrow further).
#[must_use]
pub fn compute(
    snapshots: &[QuotaSnapshot],
    current_pct: f64,
    reset_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> BurnRate {
    let window = match reset_time {
        Some(reset_at) if reset_at > now && reset_at - now <= Duration::hours(24) => {
            (reset_at - now) + Duration::milliseconds(1)
        }
        _ => DEFAULT_WINDOW,
    };

    let since = now - window;
    let mut in_window: Vec<&QuotaSnapshot> =
        snapshots.iter().filter(|s| s.recorded_at >= since && s.recorded_at <= now).collect();
    in_window.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));

    let filtered = apply_reset_jump_filter(&in_window);

    let Some(oldest) = filtered.last() else {
        return BurnRate { rate_per_hour: None, hours_to_exhaustion: None, status: BurnStatus::Calculating };
    };
    if now - oldest.recorded_at < MIN_HISTORY_AGE {
        return BurnRate { rate_per_hour: None, hours_to_exhaustion: None, status: BurnStatus::Calculating };
    }

    let hours = (now - oldest.recorded_at).num_milliseconds() as f64 / 3_600_000.0;
    if hours <= 0.0 {
        return BurnRate { rate_per_hour: None, hours_to_exhaustion: None, status: BurnStatus::Calculating };
    }

    let rate = (oldest.percentage - current_pct) / hours;
    if rate.abs() > NOISE_CAP_PCT_PER_HOUR {
        return BurnRate { rate_per_hour: None, hours_to_exhaustion: None, status: BurnStatus::Calculating };
    }

    let (hours_to_exhaustion, status) = if rate > 0.0 {
        (Some(current_pct / rate), BurnStatus::Burning)
    } else if rate < 0.0 {
        (None, BurnStatus::Recovering)
    } else {
        (None, BurnStatus::Stable)
    };

    if current_pct == 0.0 {
        return BurnRate { rate_per_hour: Some(rate), hours_to_exhaustion: None, status: BurnStatus::Exhausted };
    }

    BurnRate { rate_per_hour: Some(rate), hours_to_exhaustion, status }
}

/// Walking newest to oldest, an upward jump of 30 points or more between
/// adjacent snapshots marks a quota reset: everything at or older than the
/// older snapshot in that pair is pre-reset history and gets dropped.
fn apply_reset_jump_filter<'a>(newest_first: &[&'a QuotaSnapshot]) -> Vec<&'a QuotaSnapshot> {
    let mut kept = Vec::new();
    for window in newest_first.windows(2) {
        let [newer, older] = window else { unreachable!() };
        kept.push(*newer);
        if older.percentage - newer.percentage >= RESET_JUMP_THRESHOLD_PCT {
            return kept;
        }
    }
    if let Some(last) = newest_first.last() {
        if kept.last().copied() != Some(*last) {
            kept.push(*last);
        }
    }
    kept
}
