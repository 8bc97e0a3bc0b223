//! Quota-Reset Trigger: sends a near-free upstream request per quota group
//! so the upstream's 5-hour reset countdown starts on a known schedule.

use pool_core::error::{Error, Result};
use tracing::{debug, warn};

use crate::groups::QuotaGroup;
use crate::wire::{Content, GenerateContentRequest, GenerationConfig, Part};

const TRIGGER_PATH: &str = "/v1internal:generateContent";
const USER_AGENT: &str = "pool-proxy/1 (+cloud-code)";

/// Result of triggering one group.
#[derive(Debug, Clone)]
pub struct GroupResult {
    pub group: &'static str,
    pub ok: bool,
    pub status: Option<u16>,
}

/// Outcome of a full `triggerQuotaReset` egress round.
#[derive(Debug, Clone, Default)]
pub struct TriggerOutcome {
    pub success_count: usize,
    pub failure_count: usize,
    pub groups_triggered: Vec<GroupResult>,
}

/// Sends the minimal trigger request for one or more groups, trying each
/// base URL in `base_urls` in order until one answers.
pub struct ResetTrigger {
    client: reqwest::Client,
    base_urls: Vec<String>,
}

impl ResetTrigger {
    #[must_use]
    pub fn new(client: reqwest::Client, base_urls: Vec<String>) -> Self {
        Self { client, base_urls }
    }

    /// Trigger every group in `groups` for one account/project/token,
    /// tolerating 429 as success (the reset timer is already ticking).
    pub async fn trigger(&self, access_token: &str, project: &str, groups: &[QuotaGroup]) -> TriggerOutcome {
        let mut outcome = TriggerOutcome::default();
        for group in groups {
            let result = self.trigger_one(access_token, project, *group).await;
            if result.ok {
                outcome.success_count += 1;
            } else {
                outcome.failure_count += 1;
            }
            outcome.groups_triggered.push(result);
        }
        outcome
    }

    async fn trigger_one(&self, access_token: &str, project: &str, group: QuotaGroup) -> GroupResult {
        let body = serde_json::json!({
            "project": project,
            "model": group.trigger_model(),
            "request": GenerateContentRequest {
                contents: vec![Content { role: Some("user".into()), parts: vec![Part::Text { text: "Hi".into(), thought: None, thought_signature: None }] }],
                system_instruction: None,
                tools: None,
                generation_config: GenerationConfig { max_output_tokens: Some(1), ..Default::default() },
                safety_settings: None,
            },
        });

        match self.post(access_token, &body).await {
            Ok(status) if status == 429 || (200..300).contains(&status) => {
                GroupResult { group: group.key(), ok: true, status: Some(status) }
            }
            Ok(status) => GroupResult { group: group.key(), ok: false, status: Some(status) },
            Err(e) => {
                warn!(group = group.key(), error = %e, "reset trigger request failed");
                GroupResult { group: group.key(), ok: false, status: None }
            }
        }
    }

    async fn post(&self, access_token: &str, body: &serde_json::Value) -> Result<u16> {
        let mut last_auth_failure = None;
        for base in &self.base_urls {
            let url = format!("{base}{TRIGGER_PATH}");
            debug!(url = %url, "sending quota-reset trigger");
            let resp = self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .header("user-agent", USER_AGENT)
                .header("content-type", "application/json")
                .json(body)
                .send()
                .await;
            match resp {
                Ok(r) => {
                    let status = r.status().as_u16();
                    if status == 401 || status == 403 {
                        warn!(url = %url, status, "reset trigger auth failure, rotating to next endpoint");
                        last_auth_failure = Some(status);
                        continue;
                    }
                    return Ok(status);
                }
                Err(_) => continue,
            }
        }
        if let Some(status) = last_auth_failure {
            return Ok(status);
        }
        Err(Error::Internal("no reachable base URL for reset trigger".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn scenario_two_ok_one_rate_limited_all_count_as_success() {
        // The 429-as-success rule means three distinct HTTP outcomes collapse
        // to the same `{successCount:3, failureCount:0}` shape.
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TRIGGER_PATH))
            .respond_with(ResponseTemplate::new(200))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(TRIGGER_PATH))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let trigger = ResetTrigger::new(reqwest::Client::new(), vec![server.uri()]);
        let outcome = trigger.trigger("token", "proj-1", &QuotaGroup::ALL).await;

        assert_eq!(outcome.success_count, 3);
        assert_eq!(outcome.failure_count, 0);
    }

    #[tokio::test]
    async fn auth_failure_rotates_to_the_next_base_url() {
        let bad = MockServer::start().await;
        Mock::given(method("POST")).and(path(TRIGGER_PATH)).respond_with(ResponseTemplate::new(401)).mount(&bad).await;
        let good = MockServer::start().await;
        Mock::given(method("POST")).and(path(TRIGGER_PATH)).respond_with(ResponseTemplate::new(200)).mount(&good).await;

        let trigger = ResetTrigger::new(reqwest::Client::new(), vec![bad.uri(), good.uri()]);
        let outcome = trigger.trigger("token", "proj-1", &[QuotaGroup::Claude]).await;

        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.failure_count, 0);
    }

    #[tokio::test]
    async fn auth_failure_on_every_base_url_is_reported_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path(TRIGGER_PATH)).respond_with(ResponseTemplate::new(403)).mount(&server).await;

        let trigger = ResetTrigger::new(reqwest::Client::new(), vec![server.uri()]);
        let outcome = trigger.trigger("token", "proj-1", &[QuotaGroup::Claude]).await;

        assert_eq!(outcome.success_count, 0);
        assert_eq!(outcome.failure_count, 1);
        assert_eq!(outcome.groups_triggered[0].status, Some(403));
    }
}
