//! Scheduler: pure selection of the next `(account, model)` to try, under
//! one of four named policies. Consumes a pre-fetched state snapshot; never
//! performs I/O itself. Sticky and round-robin keep small cross-request
//! cursors, but those are in-memory bookkeeping, not upstream calls.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::groups::QuotaGroup;

/// A concrete attempt to serve a request with a chosen `(account, model)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPlan {
    /// Account to use for this attempt.
    pub account_email: String,
    /// Model id to request.
    pub model_id: String,
    /// 1-based attempt number within the caller-visible request.
    pub attempt: u32,
}

/// A scheduler's view of one account, pre-fetched by the caller (the
/// Account Pool) from the Ledger and the latest capacity snapshot.
#[derive(Debug, Clone)]
pub struct AccountView {
    /// Account identity.
    pub email: String,
    /// Whether this account is eligible to serve the requested model right now.
    pub eligible: bool,
    /// Remaining percentage in the model's pool, used by `drain-highest`.
    pub pool_percentage: f64,
    /// Earliest reset time among this account's currently rate-limited
    /// models in the pool, used by `refresh-priority`.
    pub earliest_reset: Option<DateTime<Utc>>,
}

/// Selects accounts under a named policy, with small persisted cursors for
/// the policies that need cross-request memory (`sticky`, `round-robin`).
pub struct Scheduler {
    mode: pool_core::config::SchedulingMode,
    sticky_active: RwLock<HashMap<&'static str, String>>,
    round_robin_cursor: RwLock<HashMap<&'static str, usize>>,
}

impl Scheduler {
    /// Build a scheduler using `mode` as its default policy.
    #[must_use]
    pub fn new(mode: pool_core::config::SchedulingMode) -> Self {
        Self { mode, sticky_active: RwLock::new(HashMap::new()), round_robin_cursor: RwLock::new(HashMap::new()) }
    }

    /// Order `accounts` (insertion order, stable) into an attempt list for
    /// `model_id`, capped at `max_attempts`. Ineligible accounts are
    /// dropped entirely; ties break by insertion order.
    pub async fn plan(&self, group: QuotaGroup, model_id: &str, accounts: &[AccountView], max_attempts: u32) -> Vec<RequestPlan> {
        let eligible: Vec<&AccountView> = accounts.iter().filter(|a| a.eligible).collect();
        if eligible.is_empty() {
            return Vec::new();
        }

        let ordered = match self.mode {
            pool_core::config::SchedulingMode::Sticky => self.order_sticky(group, &eligible).await,
            pool_core::config::SchedulingMode::RefreshPriority => order_refresh_priority(&eligible),
            pool_core::config::SchedulingMode::DrainHighest => order_drain_highest(&eligible),
            pool_core::config::SchedulingMode::RoundRobin => self.order_round_robin(group, &eligible).await,
        };

        ordered
            .into_iter()
            .take(max_attempts as usize)
            .enumerate()
            .map(|(idx, email)| RequestPlan { account_email: email, model_id: model_id.to_string(), attempt: (idx + 1) as u32 })
            .collect()
    }

    /// Record which account actually served a request, so `sticky` keeps
    /// using it on the next call instead of re-deriving from scratch.
    pub async fn note_active(&self, group: QuotaGroup, account_email: &str) {
        self.sticky_active.write().await.insert(group.key(), account_email.to_string());
    }

    async fn order_sticky(&self, group: QuotaGroup, eligible: &[&AccountView]) -> Vec<String> {
        let active = self.sticky_active.read().await.get(group.key()).cloned();
        let mut ordered: Vec<String> = Vec::with_capacity(eligible.len());
        if let Some(active_email) = &active {
            if eligible.iter().any(|a| &a.email == active_email) {
                ordered.push(active_email.clone());
            }
        }
        for account in eligible {
            if !ordered.contains(&account.email) {
                ordered.push(account.email.clone());
            }
        }
        ordered
    }

    async fn order_round_robin(&self, group: QuotaGroup, eligible: &[&AccountView]) -> Vec<String> {
        let mut cursor = self.round_robin_cursor.write().await;
        let start = *cursor.get(group.key()).unwrap_or(&0) % eligible.len();
        cursor.insert(group.key(), (start + 1) % eligible.len());
        (0..eligible.len()).map(|i| eligible[(start + i) % eligible.len()].email.clone()).collect()
    }
}

fn order_refresh_priority(eligible: &[&AccountView]) -> Vec<String> {
    let mut indexed: Vec<&&AccountView> = eligible.iter().collect();
    indexed.sort_by(|a, b| match (a.earliest_reset, b.earliest_reset) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    indexed.into_iter().map(|a| a.email.clone()).collect()
}

fn order_drain_highest(eligible: &[&AccountView]) -> Vec<String> {
    let mut indexed: Vec<&&AccountView> = eligible.iter().collect();
    indexed.sort_by(|a, b| b.pool_percentage.partial_cmp(&a.pool_percentage).unwrap_or(std::cmp::Ordering::Equal));
    indexed.into_iter().map(|a| a.email.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(email: &str, eligible: bool, pct: f64) -> AccountView {
        AccountView { email: email.to_string(), eligible, pool_percentage: pct, earliest_reset: None }
    }

    #[tokio::test]
    async fn drain_highest_prefers_highest_remaining_quota() {
        let scheduler = Scheduler::new(pool_core::config::SchedulingMode::DrainHighest);
        let accounts = vec![view("a", true, 80.0), view("b", true, 100.0)];
        let plan = scheduler.plan(QuotaGroup::Claude, "claude-opus-4-5", &accounts, 4).await;
        assert_eq!(plan[0].account_email, "b");
        assert_eq!(plan[1].account_email, "a");
    }

    #[tokio::test]
    async fn sticky_keeps_last_active_account_first() {
        let scheduler = Scheduler::new(pool_core::config::SchedulingMode::Sticky);
        scheduler.note_active(QuotaGroup::Claude, "b").await;
        let accounts = vec![view("a", true, 80.0), view("b", true, 50.0)];
        let plan = scheduler.plan(QuotaGroup::Claude, "claude-opus-4-5", &accounts, 4).await;
        assert_eq!(plan[0].account_email, "b");
    }

    #[tokio::test]
    async fn round_robin_advances_cursor_across_calls() {
        let scheduler = Scheduler::new(pool_core::config::SchedulingMode::RoundRobin);
        let accounts = vec![view("a", true, 0.0), view("b", true, 0.0)];
        let first = scheduler.plan(QuotaGroup::Claude, "m", &accounts, 1).await;
        let second = scheduler.plan(QuotaGroup::Claude, "m", &accounts, 1).await;
        assert_ne!(first[0].account_email, second[0].account_email);
    }

    #[tokio::test]
    async fn ineligible_accounts_are_dropped() {
        let scheduler = Scheduler::new(pool_core::config::SchedulingMode::Sticky);
        let accounts = vec![view("a", false, 0.0)];
        let plan = scheduler.plan(QuotaGroup::Claude, "m", &accounts, 4).await;
        assert!(plan.is_empty());
    }
}
