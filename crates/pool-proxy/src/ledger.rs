//! Rate-Limit Ledger: per-account, per-model rate-limit flags with reset
//! times, plus group-scoped clearing used by the quota-reset trigger.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::groups::{classify_model, QuotaGroup};

/// A single model's rate-limit state on one account.
#[derive(Debug, Clone, Default)]
pub struct RateLimitEntry {
    is_rate_limited: bool,
    reset_time: Option<DateTime<Utc>>,
}

impl RateLimitEntry {
    /// Whether this entry is still in effect at `now`, lazily treating a
    /// past (or absent-but-flagged) reset time as cleared once `now` has
    /// passed it; an entry with no reset time at all stays limited until
    /// explicitly cleared.
    #[must_use]
    fn active(&self, now: DateTime<Utc>) -> bool {
        if !self.is_rate_limited {
            return false;
        }
        match self.reset_time {
            Some(reset_at) => now < reset_at,
            None => true,
        }
    }
}

/// Per-account, per-model rate-limit bookkeeping, serialized behind a single
/// lock (the ledger is one of the Pool's protected resources, not a
/// standalone mutex-per-account design — critical sections never hold I/O).
#[derive(Default)]
pub struct Ledger {
    entries: RwLock<HashMap<(String, String), RateLimitEntry>>,
}

/// Result of a group-scoped (or "all") clear operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearOutcome {
    /// Distinct accounts that had at least one entry cleared.
    pub accounts_affected: usize,
    /// Total entries flipped from limited to clear.
    pub limits_cleared: usize,
}

impl Ledger {
    /// Build an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `model_id` is currently rate-limited on `account_email`.
    pub async fn is_rate_limited(&self, account_email: &str, model_id: &str, now: DateTime<Utc>) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(&(account_email.to_string(), model_id.to_string()))
            .is_some_and(|e| e.active(now))
    }

    /// Mark `model_id` rate-limited on `account_email` until `reset_at`
    /// (`None` meaning "limited, reset time unknown").
    pub async fn mark_rate_limited(&self, account_email: &str, model_id: &str, reset_at: Option<DateTime<Utc>>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            (account_email.to_string(), model_id.to_string()),
            RateLimitEntry { is_rate_limited: true, reset_time: reset_at },
        );
    }

    /// Clear rate limits for one account. `group` of `None` clears every
    /// model on the account regardless of group (the `"all"` semantics).
    pub async fn clear_group(&self, account_email: &str, group: Option<QuotaGroup>) -> ClearOutcome {
        let mut entries = self.entries.write().await;
        let mut cleared = 0usize;
        for ((email, model_id), entry) in entries.iter_mut() {
            if email != account_email {
                continue;
            }
            if let Some(g) = group {
                if classify_model(model_id) != g {
                    continue;
                }
            }
            if entry.is_rate_limited {
                entry.is_rate_limited = false;
                entry.reset_time = None;
                cleared += 1;
            }
        }
        ClearOutcome { accounts_affected: usize::from(cleared > 0), limits_cleared: cleared }
    }

    /// Clear rate limits across every account. `group` of `None` is the
    /// `clearGroup("all")` operation.
    pub async fn clear_group_all_accounts(&self, group: Option<QuotaGroup>) -> ClearOutcome {
        let mut entries = self.entries.write().await;
        let mut affected_accounts = std::collections::HashSet::new();
        let mut cleared = 0usize;
        for ((email, model_id), entry) in entries.iter_mut() {
            if let Some(g) = group {
                if classify_model(model_id) != g {
                    continue;
                }
            }
            if entry.is_rate_limited {
                entry.is_rate_limited = false;
                entry.reset_time = None;
                cleared += 1;
                affected_accounts.insert(email.clone());
            }
        }
        ClearOutcome { accounts_affected: affected_accounts.len(), limits_cleared: cleared }
    }

    /// The soonest reset time among `account_email`'s currently-active
    /// limits within `group`, used by the `refresh-priority` scheduling
    /// policy to prefer accounts about to come back over ones with no known
    /// reset at all.
    pub async fn earliest_reset_in_group(&self, account_email: &str, group: QuotaGroup, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|((email, model_id), entry)| email == account_email && classify_model(model_id) == group && entry.active(now))
            .filter_map(|(_, entry)| entry.reset_time)
            .min()
    }

    /// Filter `candidates` down to the models currently available (not
    /// rate-limited) for `account_email`.
    pub async fn available_models(&self, account_email: &str, candidates: &[String], now: DateTime<Utc>) -> Vec<String> {
        let entries = self.entries.read().await;
        candidates
            .iter()
            .filter(|model_id| {
                !entries
                    .get(&(account_email.to_string(), (*model_id).clone()))
                    .is_some_and(|e| e.active(now))
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marks_and_clears_one_model() {
        let ledger = Ledger::new();
        let now = Utc::now();
        let reset_at = now + chrono::Duration::minutes(5);
        ledger.mark_rate_limited("a@example.com", "claude-opus-4-5", Some(reset_at)).await;
        assert!(ledger.is_rate_limited("a@example.com", "claude-opus-4-5", now).await);
        assert!(!ledger.is_rate_limited("a@example.com", "claude-opus-4-5", reset_at + chrono::Duration::seconds(1)).await);
    }

    #[tokio::test]
    async fn clear_group_all_is_idempotent() {
        let ledger = Ledger::new();
        let now = Utc::now();
        ledger.mark_rate_limited("a@example.com", "claude-opus-4-5", Some(now + chrono::Duration::minutes(5))).await;
        let first = ledger.clear_group_all_accounts(None).await;
        assert_eq!(first.limits_cleared, 1);
        let second = ledger.clear_group_all_accounts(None).await;
        assert_eq!(second.limits_cleared, 0);
    }

    #[tokio::test]
    async fn clear_group_is_scoped_by_model_family() {
        let ledger = Ledger::new();
        let now = Utc::now();
        ledger.mark_rate_limited("a@example.com", "claude-opus-4-5", Some(now + chrono::Duration::minutes(5))).await;
        ledger.mark_rate_limited("a@example.com", "gemini-2.5-pro", Some(now + chrono::Duration::minutes(5))).await;
        let outcome = ledger.clear_group("a@example.com", Some(QuotaGroup::Claude)).await;
        assert_eq!(outcome.limits_cleared, 1);
        assert!(ledger.is_rate_limited("a@example.com", "gemini-2.5-pro", now).await);
    }

    #[tokio::test]
    async fn earliest_reset_in_group_ignores_other_groups_and_expired_entries() {
        let ledger = Ledger::new();
        let now = Utc::now();
        let soon = now + chrono::Duration::minutes(5);
        let later = now + chrono::Duration::minutes(30);
        ledger.mark_rate_limited("a@example.com", "claude-haiku-4-5", Some(later)).await;
        ledger.mark_rate_limited("a@example.com", "claude-opus-4-5", Some(soon)).await;
        ledger.mark_rate_limited("a@example.com", "gemini-2.5-pro", Some(now + chrono::Duration::minutes(1))).await;

        let earliest = ledger.earliest_reset_in_group("a@example.com", QuotaGroup::Claude, now).await;
        assert_eq!(earliest, Some(soon));

        let expired = ledger.earliest_reset_in_group("a@example.com", QuotaGroup::Claude, later + chrono::Duration::seconds(1)).await;
        assert_eq!(expired, None);
    }

    #[tokio::test]
    async fn unknown_entry_is_available() {
        let ledger = Ledger::new();
        let candidates = vec!["claude-opus-4-5".to_string()];
        let available = ledger.available_models("a@example.com", &candidates, Utc::now()).await;
        assert_eq!(available, candidates);
    }
}
