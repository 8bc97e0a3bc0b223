//! Shared application state passed to every HTTP handler and background
//! task, built once at process start.

use std::sync::Arc;

use pool_core::config::PoolConfig;
use pool_proxy::account::{Account, AccountSource};
use pool_proxy::auto_refresh::AutoRefreshScheduler;
use pool_proxy::broker::{OAuthClient, TokenBroker};
use pool_proxy::handlers::GenerationClient;
use pool_proxy::pool::AccountPool;
use pool_proxy::quota_client::QuotaClient;
use pool_proxy::reset_trigger::ResetTrigger;
use pool_proxy::scheduler::Scheduler;
use pool_proxy::snapshot_store::SnapshotStore;
use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";

/// One account as read from the bootstrap accounts file.
#[derive(Debug, Deserialize)]
struct AccountSeed {
    email: String,
    refresh_token: String,
    #[serde(default)]
    source: Option<String>,
}

/// Shared, cheaply-cloneable application state.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<PoolConfig>,
    pub pool: Arc<AccountPool>,
    pub generation: Arc<GenerationClient>,
    pub reset_trigger: Arc<ResetTrigger>,
    pub auto_refresh: Arc<AutoRefreshScheduler>,
    pub fallback_model: Option<String>,
}

impl AppContext {
    /// Build the full set of components from the frozen config snapshot,
    /// loading accounts from `ACCOUNTS_FILE` (a JSON array) if set.
    pub async fn bootstrap(config: PoolConfig, oauth: OAuthClient, base_urls: Vec<String>, fallback_model: Option<String>) -> Self {
        let base_urls = if base_urls.is_empty() { vec![DEFAULT_BASE_URL.to_string()] } else { base_urls };

        let http = reqwest::Client::builder().timeout(config.request_timeout).build().expect("http client");

        let broker = TokenBroker::new(oauth, config.token_exchange_timeout);
        let scheduler = Scheduler::new(config.scheduling_mode);
        let snapshots = snapshot_store(&config).await;
        let quota_client = QuotaClient::new(http.clone(), base_urls.clone());
        let accounts = load_accounts().await;

        info!(count = accounts.len(), "loaded accounts for pool");

        let pool = Arc::new(AccountPool::new(broker, scheduler, snapshots, quota_client, accounts, config.max_attempts));
        let generation = Arc::new(GenerationClient::new(http.clone(), base_urls.clone()));
        let reset_trigger = Arc::new(ResetTrigger::new(http, base_urls));
        let auto_refresh = Arc::new(AutoRefreshScheduler::new(config.auto_refresh_interval));

        Self { config: Arc::new(config), pool, generation, reset_trigger, auto_refresh, fallback_model }
    }
}

async fn snapshot_store(config: &PoolConfig) -> SnapshotStore {
    let _ = config;
    match std::env::var("SNAPSHOT_STORE_PATH") {
        Ok(path) => SnapshotStore::open(path.into()).await,
        Err(_) => SnapshotStore::in_memory(),
    }
}

async fn load_accounts() -> Vec<Account> {
    let Ok(path) = std::env::var("ACCOUNTS_FILE") else {
        warn!("ACCOUNTS_FILE not set, starting with an empty account pool");
        return Vec::new();
    };
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, path, "failed to read accounts file, starting empty");
            return Vec::new();
        }
    };
    let seeds: Vec<AccountSeed> = match serde_json::from_str(&contents) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to parse accounts file, starting empty");
            return Vec::new();
        }
    };
    let now = chrono::Utc::now();
    seeds
        .into_iter()
        .map(|seed| {
            let source = match seed.source.as_deref() {
                Some("refresh-token") => AccountSource::RefreshToken,
                _ => AccountSource::OAuth,
            };
            Account::new(seed.email, source, seed.refresh_token, now)
        })
        .collect()
}
