//! Cloud Code internal API wire types (`cloudcode-pa.googleapis.com/v1internal:*`).
//!
//! These mirror the JSON shapes the upstream actually emits, not a
//! convenient Rust model of them — field names and optionality follow the
//! observed responses so `serde` can round-trip without lossy guessing.

use serde::{Deserialize, Serialize};

/// The outer envelope every `generateContent`/`streamGenerateContent` call
/// wraps the model request in.
#[derive(Debug, Clone, Serialize)]
pub struct CodeAssistRequest {
    /// The resolved GCP project id for the calling account.
    pub project: String,
    /// Target model id, e.g. `claude-opus-4-5` or `gemini-2.5-pro`.
    pub model: String,
    /// The actual generation request.
    pub request: GenerateContentRequest,
}

/// Gemini-shaped generation request.
#[derive(Debug, Clone, Serialize, Default)]
pub struct GenerateContentRequest {
    /// Conversation turns.
    pub contents: Vec<Content>,
    /// System prompt, kept separate from `contents` per the wire format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_settings: Option<Vec<serde_json::Value>>,
}

/// One turn of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Content {
    /// `"user"` or `"model"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

/// A single part within a turn. Untagged because the upstream distinguishes
/// variants structurally (which fields are present), not with a `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    /// Plain text, optionally a "thinking" part when `thought` is true.
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thought: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none", rename = "thoughtSignature")]
        thought_signature: Option<String>,
    },
    /// A model-initiated tool call.
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
        #[serde(skip_serializing_if = "Option::is_none", rename = "thoughtSignature")]
        thought_signature: Option<String>,
    },
    /// The caller's result for a prior tool call.
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
    /// Inline binary data (images, etc).
    InlineData { #[serde(rename = "inlineData")] inline_data: InlineData },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "maxOutputTokens")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "stopSequences")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "functionDeclarations")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

/// Upstream response to a (non-streaming) `generateContent` call.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Candidate {
    pub content: Content,
    #[serde(rename = "finishReason")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    pub prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount")]
    pub candidates_token_count: Option<u32>,
    #[serde(rename = "totalTokenCount", default)]
    pub total_token_count: u32,
}

/// One streamed chunk of a `streamGenerateContent` response. Each line of
/// the upstream stream deserializes to one of these (or an error envelope).
pub type StreamChunk = GenerateContentResponse;

#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub details: Option<Vec<serde_json::Value>>,
}

/// `loadCodeAssist` response — tier probe.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoadCodeAssistResponse {
    #[serde(rename = "cloudaicompanionProject")]
    pub cloudaicompanion_project: Option<String>,
    #[serde(rename = "currentTier")]
    pub current_tier: Option<Tier>,
    #[serde(rename = "paidTier")]
    pub paid_tier: Option<Tier>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tier {
    pub id: Option<String>,
}

/// `fetchAvailableModels` response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FetchAvailableModelsResponse {
    #[serde(default)]
    pub models: std::collections::HashMap<String, ModelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    #[serde(rename = "quotaInfo")]
    pub quota_info: Option<QuotaInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaInfo {
    #[serde(rename = "remainingFraction")]
    pub remaining_fraction: Option<f64>,
    #[serde(rename = "resetTime")]
    pub reset_time: Option<String>,
}
