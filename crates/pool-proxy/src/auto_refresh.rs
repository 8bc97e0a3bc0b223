//! Auto-Refresh Scheduler: a singleton background task that periodically
//! pins every quota group's reset timer by triggering the first OAuth
//! account and clearing the local ledger for `"all"`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::groups::QuotaGroup;
use crate::pool::AccountPool;
use crate::reset_trigger::ResetTrigger;

/// Owns the single background task, if running. `start` is idempotent;
/// `stop` cancels the pending timer.
pub struct AutoRefreshScheduler {
    interval: Duration,
    cancel: Mutex<Option<watch::Sender<()>>>,
}

impl AutoRefreshScheduler {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval, cancel: Mutex::new(None) }
    }

    /// Start the background loop if it isn't already running. Picks the
    /// first eligible OAuth account each tick, triggers every group, and
    /// clears the ledger for `"all"`.
    pub async fn start(self: &Arc<Self>, pool: Arc<AccountPool>, reset_trigger: Arc<ResetTrigger>) {
        let mut guard = self.cancel.lock().await;
        if guard.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(());
        *guard = Some(tx);
        drop(guard);

        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rx.changed() => break,
                }

                let Some(account_email) = pool.first_oauth_account().await else {
                    warn!("auto-refresh: no OAuth account available, skipping tick");
                    continue;
                };

                match pool.token_for_account(&account_email).await {
                    Ok(token) => {
                        if let Ok(project) = pool.project_for_account(&account_email, &token).await {
                            let outcome = reset_trigger.trigger(&token, &project, &QuotaGroup::ALL).await;
                            info!(success = outcome.success_count, failure = outcome.failure_count, "auto-refresh trigger round complete");
                        }
                    }
                    Err(e) => warn!(error = %e, "auto-refresh: failed to obtain token"),
                }

                let cleared = pool.trigger_quota_reset("all").await;
                let next_tick = tokio::time::Instant::now() + interval;
                info!(cleared = cleared.limits_cleared, next_tick = ?next_tick, "auto-refresh ledger cleared");
            }
        });
    }

    /// Cancel the pending timer, if running.
    pub async fn stop(&self) {
        if let Some(tx) = self.cancel.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{OAuthClient, TokenBroker};
    use crate::quota_client::QuotaClient;
    use crate::scheduler::Scheduler;
    use crate::snapshot_store::SnapshotStore;
    use pool_core::config::SchedulingMode;

    #[tokio::test]
    async fn start_is_idempotent_without_a_second_task() {
        let scheduler = Arc::new(AutoRefreshScheduler::new(Duration::from_secs(5 * 60 * 60)));
        let pool = Arc::new(AccountPool::new(
            TokenBroker::new(OAuthClient { client_id: "id".into(), client_secret: String::new() }, Duration::from_secs(30)),
            Scheduler::new(SchedulingMode::Sticky),
            SnapshotStore::in_memory(),
            QuotaClient::new(reqwest::Client::new(), vec![]),
            Vec::new(),
            4,
        ));
        let reset_trigger = Arc::new(ResetTrigger::new(reqwest::Client::new(), vec!["https://example.com".to_string()]));

        scheduler.start(pool.clone(), reset_trigger.clone()).await;
        let tx_after_first_start = scheduler.cancel.lock().await.clone();
        assert!(tx_after_first_start.is_some());

        scheduler.start(pool, reset_trigger).await;
        let tx_after_second_start = scheduler.cancel.lock().await.clone();
        assert!(tx_after_second_start.is_some(), "second start must not clear the running task's cancel guard");

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let scheduler = AutoRefreshScheduler::new(Duration::from_secs(1));
        scheduler.stop().await;
    }
}
