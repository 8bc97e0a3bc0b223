//! Message Handler (non-streaming) and Streaming Handler: orchestrate plan
//! iteration, upstream calls, retries, and model fallback for one inbound
//! `/v1/messages` request.

use std::time::Duration;

use pool_core::config::PoolConfig;
use pool_core::error::Error;
use tracing::{info, warn};

use crate::anthropic::{ErrorResponse, MessagesRequest, MessagesResponse, SseEvent};
use crate::pool::{AccountPool, Outcome};
use crate::scheduler::RequestPlan;
use crate::sse::SseStreamer;
use crate::translator::{build_upstream_request, translate_response, Translated};
use crate::wire::{ErrorEnvelope, GenerateContentResponse};

const GENERATE_PATH: &str = "/v1internal:generateContent";
const STREAM_PATH: &str = "/v1internal:streamGenerateContent";
const USER_AGENT: &str = "pool-proxy/1 (+cloud-code)";
/// Small bound on same-account 5xx retries before the Scheduler advances to
/// the next account.
const MAX_SAME_ACCOUNT_5XX_RETRIES: u32 = 1;

/// Thin HTTP client for the generation endpoints, shared by both handlers.
pub struct GenerationClient {
    client: reqwest::Client,
    base_urls: Vec<String>,
}

impl GenerationClient {
    #[must_use]
    pub fn new(client: reqwest::Client, base_urls: Vec<String>) -> Self {
        Self { client, base_urls }
    }

    async fn call(&self, path: &str, token: &str, body: &serde_json::Value) -> Result<reqwest::Response, Error> {
        let mut last_err = None;
        for base in &self.base_urls {
            let url = format!("{base}{path}");
            match self
                .client
                .post(&url)
                .bearer_auth(token)
                .header("user-agent", USER_AGENT)
                .header("content-type", "application/json")
                .json(body)
                .send()
                .await
            {
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = Some(Error::Internal(format!("upstream unreachable: {e}"))),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Internal("no base URL configured".into())))
    }
}

/// Classify a non-2xx response into the typed error vocabulary, extracting
/// a reset time from the `retryDelay` detail or `Retry-After` header when
/// the status is 429.
async fn classify_failure(resp: reqwest::Response) -> Error {
    let status = resp.status();
    let retry_after_header = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = resp.text().await.unwrap_or_default();

    if status.as_u16() == 429 || body.to_ascii_lowercase().contains("quota") {
        return Error::QuotaExhausted(body);
    }
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Error::Unauthorized(format!("{status}: {body}"));
    }
    if status.is_server_error() || Error::is_5xx_message(&body) {
        return Error::Upstream5xx(body);
    }
    if let Some(secs) = retry_after_header {
        return Error::QuotaExhausted(format!("retry after {secs}s"));
    }
    Error::Upstream4xxClient(format!("{status}: {body}"))
}

/// Parse a Gemini-shaped error body for a `retryDelay` (from the `details[]`
/// array) or a "reset after Xs" phrase in the message, returning a duration
/// from now until the hinted reset.
fn parse_retry_delay(body: &str) -> Option<Duration> {
    let envelope: ErrorEnvelope = serde_json::from_str(body).ok()?;
    if let Some(details) = envelope.error.details {
        for detail in details {
            if let Some(delay) = detail.get("retryDelay").and_then(|v| v.as_str()) {
                let digits: String = delay.chars().take_while(|c| c.is_ascii_digit()).collect();
                if let Ok(secs) = digits.parse::<u64>() {
                    return Some(Duration::from_secs(secs));
                }
            }
        }
    }
    let lower = envelope.error.message.to_ascii_lowercase();
    if let Some(idx) = lower.find("reset after ") {
        let rest = &lower[idx + "reset after ".len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(secs) = digits.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
    }
    None
}

/// Result of handling one request: a well-formed reply either way, since a
/// synthesized Anthropic error body is itself a valid response payload.
pub enum HandlerResult {
    Ok(MessagesResponse),
    Err(ErrorResponse),
}

/// Orchestrates non-streaming requests: plan iteration, translation,
/// retries, and fallback.
pub struct MessageHandler<'a> {
    pool: &'a AccountPool,
    generation: &'a GenerationClient,
    config: &'a PoolConfig,
    fallback_model: Option<&'a str>,
}

impl<'a> MessageHandler<'a> {
    #[must_use]
    pub fn new(pool: &'a AccountPool, generation: &'a GenerationClient, config: &'a PoolConfig, fallback_model: Option<&'a str>) -> Self {
        Self { pool, generation, config, fallback_model }
    }

    /// Serve one request, trying the requested model and then, if every
    /// attempt failed with a 5xx, the configured fallback model once.
    pub async fn handle(&self, request: &MessagesRequest) -> HandlerResult {
        match self.run_round(request, &request.model).await {
            RoundResult::Response(resp) => HandlerResult::Ok(resp),
            RoundResult::AllUpstream5xx if self.config.fallback_enabled => {
                if let Some(fallback) = self.fallback_model {
                    info!(model = fallback, "all attempts were 5xx, retrying with fallback model");
                    match self.run_round(request, fallback).await {
                        RoundResult::Response(resp) => return HandlerResult::Ok(resp),
                        RoundResult::AllUpstream5xx | RoundResult::OtherFailure(_) => {}
                    }
                }
                HandlerResult::Err(ErrorResponse::new("UPSTREAM_5XX", "all upstream attempts failed"))
            }
            RoundResult::AllUpstream5xx => HandlerResult::Err(ErrorResponse::new("UPSTREAM_5XX", "all upstream attempts failed")),
            RoundResult::OtherFailure(e) => HandlerResult::Err(ErrorResponse::new(e.kind(), e.to_string())),
        }
    }

    async fn run_round(&self, request: &MessagesRequest, model: &str) -> RoundResult {
        let mut tried = Vec::new();
        let mut empty_retries = 0u32;
        let mut all_were_5xx = true;
        let mut last_error = None;

        loop {
            let plans = self.pool.next_plan(model, &tried).await;
            let Some(plan) = plans.into_iter().next() else { break };

            let mut same_account_5xx = 0u32;
            let mut same_account_unauthorized = 0u32;
            loop {
                match self.attempt(request, model, &plan).await {
                    Ok(resp) => {
                        self.pool.record_outcome(&plan, Outcome::Success, chrono::Utc::now()).await;
                        return RoundResult::Response(resp);
                    }
                    Err(AttemptFailure::Empty) => {
                        self.pool.record_outcome(&plan, Outcome::EmptyResponse, chrono::Utc::now()).await;
                        empty_retries += 1;
                        all_were_5xx = false;
                        if empty_retries > self.config.max_empty_retries {
                            tried.push(plan.account_email.clone());
                            break;
                        }
                        continue;
                    }
                    Err(AttemptFailure::Error(e @ Error::Upstream5xx(_))) => {
                        same_account_5xx += 1;
                        last_error = Some(format!("{e}"));
                        if same_account_5xx > MAX_SAME_ACCOUNT_5XX_RETRIES {
                            tried.push(plan.account_email.clone());
                            break;
                        }
                        continue;
                    }
                    Err(AttemptFailure::Error(e @ Error::Unauthorized(_))) => {
                        all_were_5xx = false;
                        same_account_unauthorized += 1;
                        if same_account_unauthorized > MAX_SAME_ACCOUNT_5XX_RETRIES {
                            warn!(account = %plan.account_email, error = %e, "upstream unauthorized persisted after token refresh, marking forbidden");
                            self.pool.record_outcome(&plan, Outcome::Forbidden, chrono::Utc::now()).await;
                            tried.push(plan.account_email.clone());
                            break;
                        }
                        warn!(account = %plan.account_email, error = %e, "upstream unauthorized, refreshing token and retrying once");
                        self.pool.invalidate_token(&plan.account_email).await;
                        continue;
                    }
                    Err(AttemptFailure::Error(e @ Error::QuotaExhausted(_))) => {
                        all_were_5xx = false;
                        self.pool.record_outcome(&plan, Outcome::QuotaExhausted { reset_at: retry_reset_at(&e) }, chrono::Utc::now()).await;
                        tried.push(plan.account_email.clone());
                        break;
                    }
                    Err(AttemptFailure::Error(e @ Error::Upstream4xxClient(_))) => {
                        all_were_5xx = false;
                        warn!(account = %plan.account_email, error = %e, "upstream 4xx, advancing");
                        tried.push(plan.account_email.clone());
                        break;
                    }
                    Err(AttemptFailure::Error(e)) => {
                        all_were_5xx = false;
                        last_error = Some(format!("{e}"));
                        tried.push(plan.account_email.clone());
                        break;
                    }
                }
            }
        }

        if all_were_5xx && !tried.is_empty() {
            RoundResult::AllUpstream5xx
        } else {
            RoundResult::OtherFailure(Error::Internal(last_error.unwrap_or_else(|| "no eligible account".to_string())))
        }
    }

    async fn attempt(&self, request: &MessagesRequest, model: &str, plan: &RequestPlan) -> Result<MessagesResponse, AttemptFailure> {
        let token = self.pool.token_for_account(&plan.account_email).await.map_err(AttemptFailure::Error)?;
        let project = self.pool.project_for_account(&plan.account_email, &token).await.map_err(AttemptFailure::Error)?;
        let body = build_upstream_request(request, &project, model);

        let resp = self
            .generation
            .call(GENERATE_PATH, &token, &serde_json::to_value(&body).unwrap_or_default())
            .await
            .map_err(AttemptFailure::Error)?;

        if !resp.status().is_success() {
            return Err(AttemptFailure::Error(classify_failure(resp).await));
        }

        let parsed: GenerateContentResponse = resp
            .json()
            .await
            .map_err(|e| AttemptFailure::Error(Error::Internal(format!("invalid upstream response: {e}"))))?;

        match translate_response(&parsed, model) {
            Translated::Response(msg) => Ok(msg),
            Translated::Empty => Err(AttemptFailure::Empty),
        }
    }
}

enum AttemptFailure {
    Empty,
    Error(Error),
}

enum RoundResult {
    Response(MessagesResponse),
    AllUpstream5xx,
    OtherFailure(Error),
}

fn retry_reset_at(e: &Error) -> Option<chrono::DateTime<chrono::Utc>> {
    let Error::QuotaExhausted(body) = e else { return None };
    parse_retry_delay(body).map(|d| chrono::Utc::now() + chrono::Duration::from_std(d).unwrap_or_default())
}

/// Orchestrates streaming requests: the same plan iteration, same-account
/// retry, and fallback algorithm as [`MessageHandler`], but only up to the
/// point where the first byte reaches the client — after that there is no
/// rewinding, so a mid-stream failure becomes a synthetic terminal sequence
/// instead of a retry.
pub struct StreamingHandler<'a> {
    pool: &'a AccountPool,
    generation: &'a GenerationClient,
    config: &'a PoolConfig,
    fallback_model: Option<&'a str>,
}

impl<'a> StreamingHandler<'a> {
    #[must_use]
    pub fn new(pool: &'a AccountPool, generation: &'a GenerationClient, config: &'a PoolConfig, fallback_model: Option<&'a str>) -> Self {
        Self { pool, generation, config, fallback_model }
    }

    /// Open an upstream stream for the request, trying every eligible
    /// account for `model` and then, if every attempt failed with a 5xx,
    /// the configured fallback model once. Returns the plan that succeeded
    /// alongside the streamer and raw response, so the caller can record
    /// the outcome and start reading chunks.
    pub async fn open_with_fallback(&self, request: &MessagesRequest, model: &str) -> Result<(RequestPlan, SseStreamer, reqwest::Response), Error> {
        match self.open_round(request, model).await {
            StreamOpenResult::Opened(plan, streamer, resp) => Ok((plan, streamer, resp)),
            StreamOpenResult::AllUpstream5xx if self.config.fallback_enabled => {
                if let Some(fallback) = self.fallback_model {
                    info!(model = fallback, "all streaming attempts were 5xx, retrying with fallback model");
                    if let StreamOpenResult::Opened(plan, streamer, resp) = self.open_round(request, fallback).await {
                        return Ok((plan, streamer, resp));
                    }
                }
                Err(Error::Upstream5xx("all upstream attempts failed".to_string()))
            }
            StreamOpenResult::AllUpstream5xx => Err(Error::Upstream5xx("all upstream attempts failed".to_string())),
            StreamOpenResult::OtherFailure(e) => Err(e),
        }
    }

    async fn open_round(&self, request: &MessagesRequest, model: &str) -> StreamOpenResult {
        let mut tried = Vec::new();
        let mut all_were_5xx = true;
        let mut last_error = None;

        loop {
            let plans = self.pool.next_plan(model, &tried).await;
            let Some(plan) = plans.into_iter().next() else { break };

            let mut same_account_5xx = 0u32;
            let mut same_account_unauthorized = 0u32;
            loop {
                match self.open(request, model, &plan).await {
                    Ok((streamer, resp)) => return StreamOpenResult::Opened(plan, streamer, resp),
                    Err(e @ Error::Upstream5xx(_)) => {
                        same_account_5xx += 1;
                        last_error = Some(format!("{e}"));
                        if same_account_5xx > MAX_SAME_ACCOUNT_5XX_RETRIES {
                            tried.push(plan.account_email.clone());
                            break;
                        }
                        continue;
                    }
                    Err(e @ Error::Unauthorized(_)) => {
                        all_were_5xx = false;
                        same_account_unauthorized += 1;
                        if same_account_unauthorized > MAX_SAME_ACCOUNT_5XX_RETRIES {
                            warn!(account = %plan.account_email, error = %e, "upstream unauthorized persisted after token refresh, marking forbidden");
                            self.pool.record_outcome(&plan, Outcome::Forbidden, chrono::Utc::now()).await;
                            tried.push(plan.account_email.clone());
                            break;
                        }
                        warn!(account = %plan.account_email, error = %e, "upstream unauthorized, refreshing token and retrying once");
                        self.pool.invalidate_token(&plan.account_email).await;
                        continue;
                    }
                    Err(e @ Error::QuotaExhausted(_)) => {
                        all_were_5xx = false;
                        self.pool.record_outcome(&plan, Outcome::QuotaExhausted { reset_at: retry_reset_at(&e) }, chrono::Utc::now()).await;
                        tried.push(plan.account_email.clone());
                        break;
                    }
                    Err(e @ Error::Upstream4xxClient(_)) => {
                        all_were_5xx = false;
                        warn!(account = %plan.account_email, error = %e, "upstream 4xx, advancing");
                        tried.push(plan.account_email.clone());
                        break;
                    }
                    Err(e) => {
                        all_were_5xx = false;
                        last_error = Some(format!("{e}"));
                        tried.push(plan.account_email.clone());
                        break;
                    }
                }
            }
        }

        if all_were_5xx && !tried.is_empty() {
            StreamOpenResult::AllUpstream5xx
        } else {
            StreamOpenResult::OtherFailure(Error::Internal(last_error.unwrap_or_else(|| "no eligible account".to_string())))
        }
    }

    /// Open an upstream stream for `model` on one specific account, returning
    /// a ready-to-use [`SseStreamer`] plus the raw response to read chunks
    /// from, or a classified failure if nothing was sent downstream yet.
    pub async fn open(&self, request: &MessagesRequest, model: &str, plan: &RequestPlan) -> Result<(SseStreamer, reqwest::Response), Error> {
        let token = self.pool.token_for_account(&plan.account_email).await?;
        let project = self.pool.project_for_account(&plan.account_email, &token).await?;
        let body = build_upstream_request(request, &project, model);

        let resp = self.generation.call(STREAM_PATH, &token, &serde_json::to_value(&body).unwrap_or_default()).await?;
        if !resp.status().is_success() {
            return Err(classify_failure(resp).await);
        }
        Ok((SseStreamer::new(model.to_string()), resp))
    }

    /// Bytes already reached the client: there is no rewinding, so any
    /// mid-stream failure becomes the synthetic terminal sequence instead
    /// of a retry.
    #[must_use]
    pub fn abort_sequence(streamer: &mut SseStreamer) -> Vec<SseEvent> {
        streamer.abort()
    }
}

enum StreamOpenResult {
    Opened(RequestPlan, SseStreamer, reqwest::Response),
    AllUpstream5xx,
    OtherFailure(Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_delay_from_details_array() {
        let body = r#"{"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED","details":[{"retryDelay":"12s"}]}}"#;
        assert_eq!(parse_retry_delay(body), Some(Duration::from_secs(12)));
    }

    #[test]
    fn parses_reset_after_phrase_in_message() {
        let body = r#"{"error":{"code":429,"message":"reset after 30s please wait","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(parse_retry_delay(body), Some(Duration::from_secs(30)));
    }

    #[test]
    fn unparseable_body_yields_no_delay() {
        assert_eq!(parse_retry_delay("not json"), None);
    }
}
