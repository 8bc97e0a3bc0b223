//! Domain logic for the account pool proxy: accounts, the quota ledger and
//! burn-rate math, the scheduler, the Anthropic/Cloud-Code wire translation,
//! SSE streaming, and the request handlers that tie them together.
//!
//! Ambient concerns (config, errors, retry, clock, logging) live in
//! `pool_core`; this crate only knows about the account-pool domain.

#![forbid(unsafe_code)]

pub mod account;
pub mod anthropic;
pub mod auto_refresh;
pub mod broker;
pub mod burn_rate;
pub mod groups;
pub mod handlers;
pub mod ledger;
pub mod pool;
pub mod quota_client;
pub mod reset_trigger;
pub mod schema;
pub mod scheduler;
pub mod snapshot_store;
pub mod sse;
pub mod translator;
pub mod wire;

pub use account::{Account, AccountCapacity, AccountSource, Tier};
pub use broker::{AccessToken, OAuthClient, TokenBroker};
pub use ledger::Ledger;
pub use pool::{AccountPool, Outcome};
pub use scheduler::{RequestPlan, Scheduler};
