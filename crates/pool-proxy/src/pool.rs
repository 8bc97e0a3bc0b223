//! Account Pool: the single serialization point for account mutation,
//! composing the Token Broker, Rate-Limit Ledger, Scheduler, Snapshot
//! Store, and Quota API Client behind one facade.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pool_core::clock::{Clock, SystemClock};
use pool_core::error::Result;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::account::{Account, AccountCapacity, AccountSource, Tier};
use crate::broker::TokenBroker;
use crate::groups::{classify_model, QuotaGroup};
use crate::ledger::{ClearOutcome, Ledger};
use crate::quota_client::QuotaClient;
use crate::scheduler::{AccountView, RequestPlan, Scheduler};
use crate::snapshot_store::SnapshotStore;

/// How a completed plan attempt is classified, driving ledger and account
/// mutation. This is the terminal vocabulary the Message/Streaming Handlers
/// reduce an upstream outcome to before calling back into the Pool.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Non-empty 2xx response.
    Success,
    /// 2xx response with zero content blocks.
    EmptyResponse,
    /// 429 or quota-exhausted error; the model is now rate-limited on this account.
    QuotaExhausted { reset_at: Option<DateTime<Utc>> },
    /// 5xx from upstream; no ledger change, eligible for retry/fallback.
    Upstream5xx,
    /// 403 from the quota or generation endpoint; account is flagged unusable.
    Forbidden,
    /// Refresh token rejected with `invalid_grant`; account is terminal.
    AuthInvalidGrant,
}

/// Outcome of `triggerQuotaReset`.
#[derive(Debug, Clone, Default)]
pub struct ResetOutcome {
    pub accounts_affected: usize,
    pub limits_cleared: usize,
    pub groups: Vec<&'static str>,
}

/// Composes every pool-level component behind a single facade; this is the
/// only place `Account` state is mutated.
pub struct AccountPool {
    broker: TokenBroker,
    ledger: Ledger,
    scheduler: Scheduler,
    snapshots: SnapshotStore,
    quota_client: QuotaClient,
    accounts: RwLock<Vec<Account>>,
    projects: RwLock<HashMap<String, String>>,
    capacities: RwLock<HashMap<String, AccountCapacity>>,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
}

impl AccountPool {
    /// Assemble a pool from its components and the accounts it starts with,
    /// reading "now" from the real system clock.
    #[must_use]
    pub fn new(
        broker: TokenBroker,
        scheduler: Scheduler,
        snapshots: SnapshotStore,
        quota_client: QuotaClient,
        accounts: Vec<Account>,
        max_attempts: u32,
    ) -> Self {
        Self::with_clock(broker, scheduler, snapshots, quota_client, accounts, max_attempts, Arc::new(SystemClock))
    }

    /// Same as [`Self::new`], but with an injected clock so rate-limit and
    /// snapshot timing can be driven deterministically in tests.
    #[must_use]
    pub fn with_clock(
        broker: TokenBroker,
        scheduler: Scheduler,
        snapshots: SnapshotStore,
        quota_client: QuotaClient,
        accounts: Vec<Account>,
        max_attempts: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            ledger: Ledger::new(),
            scheduler,
            snapshots,
            quota_client,
            accounts: RwLock::new(accounts),
            projects: RwLock::new(HashMap::new()),
            capacities: RwLock::new(HashMap::new()),
            max_attempts,
            clock,
        }
    }

    /// Resolve a bearer token for `account_email`, delegating to the Broker.
    pub async fn token_for_account(&self, account_email: &str) -> Result<String> {
        let refresh_token = {
            let accounts = self.accounts.read().await;
            accounts
                .iter()
                .find(|a| a.email == account_email)
                .map(|a| a.refresh_token.clone())
                .ok_or_else(|| pool_core::error::Error::Internal(format!("unknown account {account_email}")))?
        };
        match self.broker.token_for(&refresh_token).await {
            Ok(token) => Ok(token.token),
            Err(e @ pool_core::error::Error::AuthInvalidGrant(_)) => {
                self.record_outcome(&account_email_plan(account_email), Outcome::AuthInvalidGrant, self.clock.now()).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop any cached access token for `account_email`, forcing the next
    /// `token_for_account` call to exchange a fresh one. Used when a
    /// generation call comes back 401/403 on an otherwise-eligible account.
    pub async fn invalidate_token(&self, account_email: &str) {
        let refresh_token = {
            let accounts = self.accounts.read().await;
            accounts.iter().find(|a| a.email == account_email).map(|a| a.refresh_token.clone())
        };
        if let Some(refresh_token) = refresh_token {
            self.broker.invalidate(&refresh_token).await;
        }
    }

    /// The first eligible OAuth account, used by the Auto-Refresh Scheduler
    /// to pick which identity pins the upstream reset timer each tick.
    pub async fn first_oauth_account(&self) -> Option<String> {
        self.accounts
            .read()
            .await
            .iter()
            .find(|a| a.is_eligible() && a.source == AccountSource::OAuth)
            .map(|a| a.email.clone())
    }

    /// Drop snapshot history older than `older_than`. Called periodically by
    /// the Ledger janitor background task.
    pub async fn prune_snapshots(&self, older_than: DateTime<Utc>) {
        self.snapshots.prune(older_than).await;
    }

    /// One-shot, per-account-session memoized tier probe.
    pub async fn project_for_account(&self, account_email: &str, access_token: &str) -> Result<String> {
        if let Some(project) = self.projects.read().await.get(account_email) {
            return Ok(project.clone());
        }
        let probe = self.quota_client.load_code_assist(access_token).await?;
        let project = probe.project_id.unwrap_or_default();
        self.projects.write().await.insert(account_email.to_string(), project.clone());
        Ok(project)
    }

    /// Build an ordered attempt list for `model_id`, excluding accounts
    /// already tried (and terminally failed) earlier in this caller request.
    pub async fn next_plan(&self, model_id: &str, already_tried: &[String]) -> Vec<RequestPlan> {
        let group = classify_model(model_id);
        let now = self.clock.now();
        let accounts = self.accounts.read().await;
        let capacities = self.capacities.read().await;
        let mut views = Vec::with_capacity(accounts.len());
        for account in accounts.iter() {
            if already_tried.iter().any(|e| e == &account.email) {
                continue;
            }
            let eligible = account.is_eligible() && !self.ledger.is_rate_limited(&account.email, model_id, now).await;
            let pool_percentage = capacities.get(&account.email).map(|c| group_percentage(c, group)).unwrap_or(0.0);
            let earliest_reset = self.ledger.earliest_reset_in_group(&account.email, group, now).await;
            views.push(AccountView { email: account.email.clone(), eligible, pool_percentage, earliest_reset });
        }
        drop(capacities);
        let remaining_budget = self.max_attempts.saturating_sub(already_tried.len() as u32).max(1);
        self.scheduler.plan(group, model_id, &views, remaining_budget).await
    }

    /// Apply the outcome of one plan attempt: ledger updates, `lastUsed`,
    /// and the sticky scheduler's active-account bookkeeping on success.
    pub async fn record_outcome(&self, plan: &RequestPlan, outcome: Outcome, now: DateTime<Utc>) {
        match outcome {
            Outcome::Success => {
                let mut accounts = self.accounts.write().await;
                if let Some(account) = accounts.iter_mut().find(|a| a.email == plan.account_email) {
                    account.last_used = Some(now);
                }
                self.scheduler.note_active(classify_model(&plan.model_id), &plan.account_email).await;
            }
            Outcome::QuotaExhausted { reset_at } => {
                self.ledger.mark_rate_limited(&plan.account_email, &plan.model_id, reset_at).await;
                warn!(account = %plan.account_email, model = %plan.model_id, "model rate-limited");
            }
            Outcome::Forbidden => {
                let mut accounts = self.accounts.write().await;
                if let Some(account) = accounts.iter_mut().find(|a| a.email == plan.account_email) {
                    account.forbidden = true;
                }
            }
            Outcome::AuthInvalidGrant => {
                warn!(account = %plan.account_email, "refresh token invalid, account unusable");
            }
            Outcome::Upstream5xx | Outcome::EmptyResponse => {}
        }
    }

    /// Ledger sweep for the Auto-Refresh Scheduler and manual resets.
    /// `"all"` clears every group on every account.
    pub async fn trigger_quota_reset(&self, group_key: &str) -> ResetOutcome {
        if group_key == "all" {
            let mut total = ClearOutcome::default();
            let mut groups = Vec::new();
            for group in QuotaGroup::ALL {
                let outcome = self.ledger.clear_group_all_accounts(Some(group)).await;
                total.accounts_affected += outcome.accounts_affected;
                total.limits_cleared += outcome.limits_cleared;
                groups.push(group.key());
            }
            return ResetOutcome { accounts_affected: total.accounts_affected, limits_cleared: total.limits_cleared, groups };
        }
        let Some(group) = QuotaGroup::parse(group_key) else {
            return ResetOutcome::default();
        };
        let outcome = self.ledger.clear_group_all_accounts(Some(group)).await;
        ResetOutcome { accounts_affected: outcome.accounts_affected, limits_cleared: outcome.limits_cleared, groups: vec![group.key()] }
    }

    /// Refresh one account's capacity view: tier probe + per-model quotas,
    /// recording a snapshot for each pool family.
    pub async fn refresh_capacity(&self, account_email: &str) -> Result<AccountCapacity> {
        let token = self.token_for_account(account_email).await?;
        let probe = self.quota_client.load_code_assist(&token).await?;
        let project = probe.project_id.clone();
        if let Some(p) = &project {
            self.projects.write().await.insert(account_email.to_string(), p.clone());
        }

        let models = self.quota_client.fetch_available_models(&token, project.as_deref()).await;
        let now = self.clock.now();

        let (claude_pool, gemini_pro_pool, gemini_flash_pool, is_forbidden) = match models {
            Ok(models) => {
                let mut by_group: HashMap<QuotaGroup, Vec<f64>> = HashMap::new();
                for m in &models {
                    by_group.entry(classify_model(&m.name)).or_default().push(m.percentage);
                }
                let claude = by_group.get(&QuotaGroup::Claude).and_then(|v| v.first()).copied().unwrap_or(0.0);
                let gemini_pro = mean(by_group.get(&QuotaGroup::GeminiPro));
                let gemini_flash = mean(by_group.get(&QuotaGroup::GeminiFlash));

                self.snapshots.record(account_email, "claude", claude, now).await;
                self.snapshots.record(account_email, "geminiPro", gemini_pro, now).await;
                self.snapshots.record(account_email, "geminiFlash", gemini_flash, now).await;

                (claude, gemini_pro, gemini_flash, false)
            }
            Err(pool_core::error::Error::Forbidden(_)) => {
                let mut accounts = self.accounts.write().await;
                if let Some(account) = accounts.iter_mut().find(|a| a.email == account_email) {
                    account.forbidden = true;
                }
                (0.0, 0.0, 0.0, true)
            }
            Err(e) => return Err(e),
        };

        let tier = probe.current_tier_id.as_deref().map(Tier::from_tier_id).unwrap_or_default();
        info!(account = account_email, ?tier, "refreshed account capacity");

        let capacity = AccountCapacity {
            email: account_email.to_string(),
            tier,
            claude_pool,
            gemini_pro_pool,
            gemini_flash_pool,
            project_id: project,
            last_updated: now,
            is_forbidden,
        };
        self.capacities.write().await.insert(account_email.to_string(), capacity.clone());
        Ok(capacity)
    }
}

fn mean(values: Option<&Vec<f64>>) -> f64 {
    match values {
        Some(v) if !v.is_empty() => v.iter().sum::<f64>() / v.len() as f64,
        _ => 0.0,
    }
}

/// Pick the pool percentage matching `group` out of a capacity snapshot, so
/// the Scheduler's `drain-highest` policy can compare real remaining quota
/// instead of a placeholder.
fn group_percentage(capacity: &AccountCapacity, group: QuotaGroup) -> f64 {
    match group {
        QuotaGroup::Claude => capacity.claude_pool,
        QuotaGroup::GeminiPro => capacity.gemini_pro_pool,
        QuotaGroup::GeminiFlash => capacity.gemini_flash_pool,
    }
}

fn account_email_plan(email: &str) -> RequestPlan {
    RequestPlan { account_email: email.to_string(), model_id: String::new(), attempt: 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountSource;
    use crate::broker::OAuthClient;
    use pool_core::config::SchedulingMode;

    fn test_pool(accounts: Vec<Account>) -> AccountPool {
        let broker = TokenBroker::new(OAuthClient { client_id: "id".into(), client_secret: String::new() }, std::time::Duration::from_secs(30));
        let scheduler = Scheduler::new(SchedulingMode::Sticky);
        let snapshots = SnapshotStore::in_memory();
        let quota_client = QuotaClient::new(reqwest::Client::new(), vec![]);
        AccountPool::new(broker, scheduler, snapshots, quota_client, accounts, 4)
    }

    #[tokio::test]
    async fn quota_exhausted_outcome_marks_ledger() {
        let pool = test_pool(vec![Account::new("a@example.com".into(), AccountSource::OAuth, "rt".into(), Utc::now())]);
        let plan = RequestPlan { account_email: "a@example.com".into(), model_id: "claude-opus-4-5".into(), attempt: 1 };
        pool.record_outcome(&plan, Outcome::QuotaExhausted { reset_at: None }, Utc::now()).await;
        let next = pool.next_plan("claude-opus-4-5", &[]).await;
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn next_plan_honors_an_injected_clock_for_lazy_expiry() {
        let fixed_now = Utc::now();
        let broker = TokenBroker::new(OAuthClient { client_id: "id".into(), client_secret: String::new() }, std::time::Duration::from_secs(30));
        let scheduler = Scheduler::new(SchedulingMode::Sticky);
        let snapshots = SnapshotStore::in_memory();
        let quota_client = QuotaClient::new(reqwest::Client::new(), vec![]);
        let clock: Arc<dyn pool_core::clock::Clock> = Arc::new(pool_core::clock::FixedClock(fixed_now));
        let pool = AccountPool::with_clock(
            broker,
            scheduler,
            snapshots,
            quota_client,
            vec![Account::new("a@example.com".into(), AccountSource::OAuth, "rt".into(), fixed_now)],
            4,
            clock,
        );

        let plan = RequestPlan { account_email: "a@example.com".into(), model_id: "claude-opus-4-5".into(), attempt: 1 };
        pool.record_outcome(&plan, Outcome::QuotaExhausted { reset_at: Some(fixed_now - chrono::Duration::seconds(1)) }, fixed_now).await;

        // The clock is frozen at `fixed_now`, which is already past the reset time above, so
        // `next_plan`'s internal lazy-expiry check (driven by the same injected clock) clears it.
        let next = pool.next_plan("claude-opus-4-5", &[]).await;
        assert_eq!(next.len(), 1);
    }

    #[tokio::test]
    async fn next_plan_feeds_real_capacity_into_drain_highest() {
        let broker = TokenBroker::new(OAuthClient { client_id: "id".into(), client_secret: String::new() }, std::time::Duration::from_secs(30));
        let scheduler = Scheduler::new(SchedulingMode::DrainHighest);
        let snapshots = SnapshotStore::in_memory();
        let quota_client = QuotaClient::new(reqwest::Client::new(), vec![]);
        let pool = AccountPool::new(
            broker,
            scheduler,
            snapshots,
            quota_client,
            vec![
                Account::new("a@example.com".into(), AccountSource::OAuth, "rt".into(), Utc::now()),
                Account::new("b@example.com".into(), AccountSource::OAuth, "rt".into(), Utc::now()),
            ],
            4,
        );
        pool.capacities.write().await.insert(
            "a@example.com".into(),
            AccountCapacity {
                email: "a@example.com".into(),
                tier: Tier::Pro,
                claude_pool: 20.0,
                gemini_pro_pool: 0.0,
                gemini_flash_pool: 0.0,
                project_id: None,
                last_updated: Utc::now(),
                is_forbidden: false,
            },
        );
        pool.capacities.write().await.insert(
            "b@example.com".into(),
            AccountCapacity {
                email: "b@example.com".into(),
                tier: Tier::Pro,
                claude_pool: 100.0,
                gemini_pro_pool: 0.0,
                gemini_flash_pool: 0.0,
                project_id: None,
                last_updated: Utc::now(),
                is_forbidden: false,
            },
        );

        let plan = pool.next_plan("claude-opus-4-5", &[]).await;
        assert_eq!(plan[0].account_email, "b@example.com");
        assert_eq!(plan[1].account_email, "a@example.com");
    }

    #[tokio::test]
    async fn next_plan_feeds_ledger_reset_times_into_refresh_priority() {
        let broker = TokenBroker::new(OAuthClient { client_id: "id".into(), client_secret: String::new() }, std::time::Duration::from_secs(30));
        let scheduler = Scheduler::new(SchedulingMode::RefreshPriority);
        let snapshots = SnapshotStore::in_memory();
        let quota_client = QuotaClient::new(reqwest::Client::new(), vec![]);
        let pool = AccountPool::new(
            broker,
            scheduler,
            snapshots,
            quota_client,
            vec![
                Account::new("a@example.com".into(), AccountSource::OAuth, "rt".into(), Utc::now()),
                Account::new("b@example.com".into(), AccountSource::OAuth, "rt".into(), Utc::now()),
            ],
            4,
        );
        // `a` still has a sibling claude model winding down; `b`'s claude group is clear.
        let sibling = RequestPlan { account_email: "a@example.com".into(), model_id: "claude-haiku-4-5".into(), attempt: 1 };
        pool.record_outcome(&sibling, Outcome::QuotaExhausted { reset_at: Some(Utc::now() + chrono::Duration::minutes(30)) }, Utc::now()).await;

        let plan = pool.next_plan("claude-opus-4-5", &[]).await;
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].account_email, "a@example.com");
    }

    #[tokio::test]
    async fn already_tried_accounts_are_excluded() {
        let pool = test_pool(vec![
            Account::new("a@example.com".into(), AccountSource::OAuth, "rt".into(), Utc::now()),
            Account::new("b@example.com".into(), AccountSource::OAuth, "rt".into(), Utc::now()),
        ]);
        let next = pool.next_plan("claude-opus-4-5", &["a@example.com".to_string()]).await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].account_email, "b@example.com");
    }

    #[tokio::test]
    async fn trigger_reset_all_clears_every_group() {
        let pool = test_pool(vec![Account::new("a@example.com".into(), AccountSource::OAuth, "rt".into(), Utc::now())]);
        let plan = RequestPlan { account_email: "a@example.com".into(), model_id: "claude-opus-4-5".into(), attempt: 1 };
        pool.record_outcome(&plan, Outcome::QuotaExhausted { reset_at: None }, Utc::now()).await;
        let outcome = pool.trigger_quota_reset("all").await;
        assert_eq!(outcome.limits_cleared, 1);
        assert_eq!(outcome.groups.len(), 3);
    }
}
