//! Quota API Client: tier probe (`loadCodeAssist`) and per-model quota
//! snapshot (`fetchAvailableModels`) against the Cloud Code internal API,
//! trying each configured base URL in order until one answers.

use pool_core::error::{Error, Result};
use tracing::{debug, warn};

use crate::wire::{FetchAvailableModelsResponse, LoadCodeAssistResponse};

const DEFAULT_BASE_URLS: &[&str] = &["https://cloudcode-pa.googleapis.com"];
const USER_AGENT: &str = "pool-proxy/1 (+cloud-code)";

/// Result of the tier probe: the project to address requests to and the
/// account's subscription tier.
#[derive(Debug, Clone)]
pub struct TierProbe {
    /// Resolved GCP project id for this account.
    pub project_id: Option<String>,
    /// `currentTier.id`, used to distinguish FREE/PRO/ULTRA.
    pub current_tier_id: Option<String>,
    /// `paidTier.id`, present once the account has a paid tier on file.
    pub paid_tier_id: Option<String>,
}

/// Remaining-quota percentage and reset time for one model, as reported by
/// `fetchAvailableModels`.
#[derive(Debug, Clone)]
pub struct ModelQuotaInfo {
    /// Model id as returned by the upstream.
    pub name: String,
    /// 0-100; a missing or null `remainingFraction` is reported as 0.
    pub percentage: f64,
    /// Raw `resetTime` string from the upstream, if present.
    pub reset_time: Option<String>,
}

/// Thin HTTP client for the two quota-related Cloud Code internal endpoints.
pub struct QuotaClient {
    client: reqwest::Client,
    base_urls: Vec<String>,
}

impl QuotaClient {
    /// Build a client trying `base_urls` in order, falling back to the
    /// single known production base URL when none are configured.
    #[must_use]
    pub fn new(client: reqwest::Client, base_urls: Vec<String>) -> Self {
        let base_urls = if base_urls.is_empty() {
            DEFAULT_BASE_URLS.iter().map(|s| (*s).to_string()).collect()
        } else {
            base_urls
        };
        Self { client, base_urls }
    }

    /// Probe the account's tier and resolve its project id, trying each
    /// base URL until one responds.
    pub async fn load_code_assist(&self, access_token: &str) -> Result<TierProbe> {
        let body = serde_json::json!({ "metadata": { "ideType": "ANTIGRAVITY" } });
        let resp: LoadCodeAssistResponse = self.post_json(access_token, "/v1internal:loadCodeAssist", &body).await?;
        Ok(TierProbe {
            project_id: resp.cloudaicompanion_project,
            current_tier_id: resp.current_tier.and_then(|t| t.id),
            paid_tier_id: resp.paid_tier.and_then(|t| t.id),
        })
    }

    /// Fetch per-model quota info. A 403 from every base URL marks the
    /// account forbidden (`Error::Forbidden`); other failures bubble as
    /// transient so the caller can retry or move on without flagging the
    /// account.
    pub async fn fetch_available_models(&self, access_token: &str, project_id: Option<&str>) -> Result<Vec<ModelQuotaInfo>> {
        let body = match project_id {
            Some(p) => serde_json::json!({ "project": p }),
            None => serde_json::json!({}),
        };
        let resp: FetchAvailableModelsResponse =
            self.post_json(access_token, "/v1internal:fetchAvailableModels", &body).await?;

        Ok(resp
            .models
            .into_iter()
            .map(|(name, entry)| {
                let quota = entry.quota_info;
                let percentage = quota.as_ref().and_then(|q| q.remaining_fraction).unwrap_or(0.0) * 100.0;
                let reset_time = quota.and_then(|q| q.reset_time);
                ModelQuotaInfo { name, percentage, reset_time }
            })
            .collect())
    }

    async fn post_json<T: serde::de::DeserializeOwned>(&self, access_token: &str, path: &str, body: &serde_json::Value) -> Result<T> {
        let mut last_err: Option<Error> = None;
        for base in &self.base_urls {
            let url = format!("{base}{path}");
            debug!(url = %url, "calling cloud code internal endpoint");
            let resp = self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .header("user-agent", USER_AGENT)
                .header("content-type", "application/json")
                .json(body)
                .send()
                .await;

            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(Error::Internal(format!("quota endpoint unreachable: {e}")));
                    continue;
                }
            };

            let status = resp.status();
            if status.as_u16() == 403 {
                return Err(Error::Forbidden(format!("{path} returned 403")));
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                warn!(status = %status, path, "quota endpoint returned non-success status");
                last_err = Some(Error::Internal(format!("{path} returned {status}: {text}")));
                continue;
            }

            return resp.json::<T>().await.map_err(|e| Error::Internal(format!("invalid {path} response: {e}")));
        }
        Err(last_err.unwrap_or_else(|| Error::Internal(format!("no base URL configured for {path}"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn defaults_to_known_base_url_when_unconfigured() {
        let client = QuotaClient::new(reqwest::Client::new(), vec![]);
        assert_eq!(client.base_urls, vec!["https://cloudcode-pa.googleapis.com".to_string()]);
    }

    #[tokio::test]
    async fn null_remaining_fraction_reports_zero_percentage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:fetchAvailableModels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": { "claude-opus-4-5": { "quotaInfo": null } }
            })))
            .mount(&server)
            .await;

        let client = QuotaClient::new(reqwest::Client::new(), vec![server.uri()]);
        let models = client.fetch_available_models("token", Some("proj-1")).await.expect("request succeeds");

        assert_eq!(models.len(), 1);
        assert_eq!(models[0].percentage, 0.0);
    }

    #[tokio::test]
    async fn half_remaining_fraction_is_fifty_percent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:fetchAvailableModels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": { "claude-opus-4-5": { "quotaInfo": { "remainingFraction": 0.5, "resetTime": null } } }
            })))
            .mount(&server)
            .await;

        let client = QuotaClient::new(reqwest::Client::new(), vec![server.uri()]);
        let models = client.fetch_available_models("token", Some("proj-1")).await.expect("request succeeds");

        assert_eq!(models.len(), 1);
        assert_eq!(models[0].percentage, 50.0);
    }

    #[tokio::test]
    async fn forbidden_on_every_base_url_flags_the_account() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/v1internal:fetchAvailableModels")).respond_with(ResponseTemplate::new(403)).mount(&server).await;

        let client = QuotaClient::new(reqwest::Client::new(), vec![server.uri()]);
        let err = client.fetch_available_models("token", Some("proj-1")).await.unwrap_err();

        assert!(matches!(err, Error::Forbidden(_)));
    }
}
