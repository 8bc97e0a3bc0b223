//! Account identity and capacity snapshot types. Mutation of `Account` is
//! the Pool's exclusive responsibility; everything here is otherwise
//! value-typed.

use chrono::{DateTime, Utc};

/// How an account's refresh token was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountSource {
    /// Produced by the (external) browser-based OAuth flow.
    OAuth,
    /// Supplied directly as a bare refresh token.
    RefreshToken,
}

/// One Google identity usable against Cloud Code.
#[derive(Debug, Clone)]
pub struct Account {
    /// Unique identity within the pool.
    pub email: String,
    /// How the refresh token was obtained.
    pub source: AccountSource,
    /// Opaque refresh token, never logged.
    pub refresh_token: String,
    /// When this account was added to the pool.
    pub added_at: DateTime<Utc>,
    /// Last time a request was successfully served by this account.
    pub last_used: Option<DateTime<Utc>>,
    /// Set once `fetchAvailableModels` returns 403 for this account.
    pub forbidden: bool,
}

impl Account {
    /// Build a freshly onboarded account.
    #[must_use]
    pub fn new(email: String, source: AccountSource, refresh_token: String, now: DateTime<Utc>) -> Self {
        Self { email, source, refresh_token, added_at: now, last_used: None, forbidden: false }
    }

    /// Non-OAuth/refresh-token accounts are never eligible for API calls.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        !self.refresh_token.is_empty() && !self.forbidden
    }
}

/// Subscription tier as reported by the tier probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tier {
    /// Free tier.
    Free,
    /// Paid "Pro" tier.
    Pro,
    /// Paid "Ultra" tier.
    Ultra,
    /// Tier could not be determined.
    #[default]
    Unknown,
}

impl Tier {
    /// Map a `currentTier.id`/`paidTier.id` string onto a tier, defaulting
    /// to `Unknown` for anything unrecognized.
    #[must_use]
    pub fn from_tier_id(id: &str) -> Self {
        match id.to_ascii_lowercase().as_str() {
            s if s.contains("ultra") => Tier::Ultra,
            s if s.contains("pro") => Tier::Pro,
            s if s.contains("free") => Tier::Free,
            _ => Tier::Unknown,
        }
    }
}

/// A point-in-time view of one account's capacity, combining the tier probe
/// and the three pool percentages.
#[derive(Debug, Clone)]
pub struct AccountCapacity {
    /// Account identity.
    pub email: String,
    /// Subscription tier.
    pub tier: Tier,
    /// Aggregate remaining percentage for the `claude` pool.
    pub claude_pool: f64,
    /// Aggregate remaining percentage for the `geminiPro` pool.
    pub gemini_pro_pool: f64,
    /// Aggregate remaining percentage for the `geminiFlash` pool.
    pub gemini_flash_pool: f64,
    /// Resolved GCP project id, if known.
    pub project_id: Option<String>,
    /// When this snapshot was taken.
    pub last_updated: DateTime<Utc>,
    /// Whether the last quota fetch returned 403 for this account.
    pub is_forbidden: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_without_refresh_token_is_ineligible() {
        let account = Account::new("a@example.com".into(), AccountSource::RefreshToken, String::new(), Utc::now());
        assert!(!account.is_eligible());
    }

    #[test]
    fn forbidden_account_is_ineligible() {
        let mut account = Account::new("a@example.com".into(), AccountSource::OAuth, "rt".into(), Utc::now());
        account.forbidden = true;
        assert!(!account.is_eligible());
    }

    #[test]
    fn tier_id_matching_is_case_insensitive() {
        assert_eq!(Tier::from_tier_id("ULTRA"), Tier::Ultra);
        assert_eq!(Tier::from_tier_id("standard-free"), Tier::Free);
        assert_eq!(Tier::from_tier_id("mystery"), Tier::Unknown);
    }
}
