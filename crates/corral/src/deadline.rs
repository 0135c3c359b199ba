//! Deadlines for caller-supplied budgets.
//!
//! Budgets such as `Duration::MAX` overflow `Instant` arithmetic. They are
//! capped at a horizon far beyond any test session instead.

use std::time::{Duration, Instant};

/// Stand-in for "never" when a budget does not fit in an `Instant`.
const HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Instant `budget` from now, capped at [`HORIZON`] when it would overflow.
pub(crate) fn after(budget: Duration) -> Instant {
    after_from(Instant::now(), budget)
}

/// Like [`after`], measured from `start`.
pub(crate) fn after_from(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .or_else(|| start.checked_add(HORIZON))
        .unwrap_or(start)
}
