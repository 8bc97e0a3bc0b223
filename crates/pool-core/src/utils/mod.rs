//! Shared utilities for the pool runtime.
//!
//! - retry: retry logic with exponential backoff, used by every upstream caller.

mod retry;

pub use retry::{retry_with_backoff, RetryConfig, RetryError};
