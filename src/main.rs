//! Entry point: loads configuration, bootstraps the account pool, and
//! serves the Anthropic-compatible `/v1/messages` endpoint.

mod app;
mod server;

use std::net::SocketAddr;

use clap::Parser;
use pool_core::config::PoolConfig;
use pool_proxy::broker::OAuthClient;
use tracing::{error, info};

/// Local reverse proxy over a pool of Google Cloud Code accounts.
#[derive(Parser, Debug)]
#[command(name = "cloud-code-proxy")]
struct Cli {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen: SocketAddr,

    /// Fallback model to retry with when every attempt on the requested
    /// model fails with a 5xx.
    #[arg(long)]
    fallback_model: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pool_core::logging::init();
    let cli = Cli::parse();
    let config = PoolConfig::from_env();

    let oauth = OAuthClient {
        client_id: std::env::var("GOOGLE_OAUTH_CLIENT_ID").unwrap_or_default(),
        client_secret: std::env::var("GOOGLE_OAUTH_CLIENT_SECRET").unwrap_or_default(),
    };
    let base_urls: Vec<String> = std::env::var("CLOUD_CODE_BASE_URLS")
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let ctx = app::AppContext::bootstrap(config.clone(), oauth, base_urls, cli.fallback_model).await;

    if config.trigger_reset_on_start {
        info!("triggering one-shot quota reset at startup");
        let outcome = ctx.pool.trigger_quota_reset("all").await;
        info!(cleared = outcome.limits_cleared, "startup quota reset complete");
    }

    if config.auto_refresh {
        let pool = ctx.pool.clone();
        let reset_trigger = ctx.reset_trigger.clone();
        ctx.auto_refresh.start(pool, reset_trigger).await;
        info!("auto-refresh scheduler started");
    }

    spawn_ledger_janitor(ctx.pool.clone(), config.snapshot_retention, config.snapshot_janitor_interval);

    let app = server::router(ctx);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(addr = %cli.listen, "cloud-code-proxy listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server exited with error");
        return Err(e.into());
    }
    Ok(())
}

/// Unconditional background task that prunes snapshot history older than
/// `retention` every `interval`, so the account pool's quota-snapshot log
/// doesn't grow without bound.
fn spawn_ledger_janitor(pool: std::sync::Arc<pool_proxy::pool::AccountPool>, retention: std::time::Duration, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            let cutoff = chrono::Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
            pool.prune_snapshots(cutoff).await;
            info!(?cutoff, "ledger janitor pruned snapshot history");
        }
    });
}
