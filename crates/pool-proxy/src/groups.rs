//! Quota group classification: which models share a reset timer upstream.

/// A set of model IDs that share one reset timer upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaGroup {
    /// All Anthropic-family models on an account, assumed to share one quota.
    Claude,
    /// Gemini models whose id contains `pro`.
    GeminiPro,
    /// Gemini models whose id contains `flash`.
    GeminiFlash,
}

impl QuotaGroup {
    /// All groups, in a stable order.
    pub const ALL: [QuotaGroup; 3] = [QuotaGroup::Claude, QuotaGroup::GeminiPro, QuotaGroup::GeminiFlash];

    /// Stable key used in ledger/snapshot lookups and API responses.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            QuotaGroup::Claude => "claude",
            QuotaGroup::GeminiPro => "geminiPro",
            QuotaGroup::GeminiFlash => "geminiFlash",
        }
    }

    /// The near-free model used to send a reset-pinning trigger request for this group.
    #[must_use]
    pub fn trigger_model(self) -> &'static str {
        match self {
            QuotaGroup::Claude => "claude-haiku-4-5",
            QuotaGroup::GeminiPro => "gemini-2.5-pro",
            QuotaGroup::GeminiFlash => "gemini-2.5-flash",
        }
    }

    /// Parse a group by its stable key, used by `clearGroup`/trigger requests.
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "claude" => Some(QuotaGroup::Claude),
            "geminiPro" => Some(QuotaGroup::GeminiPro),
            "geminiFlash" => Some(QuotaGroup::GeminiFlash),
            _ => None,
        }
    }
}

/// Classify a model id into exactly one pool by substring rule: anything not
/// recognizably Gemini is treated as Claude-family; Gemini ids containing
/// `pro` or `flash` split into the two Gemini pools. `gemini` ids matching
/// neither default to `geminiFlash`, the cheaper/more available tier.
#[must_use]
pub fn classify_model(model_id: &str) -> QuotaGroup {
    let lower = model_id.to_ascii_lowercase();
    if lower.contains("gemini") {
        if lower.contains("pro") {
            QuotaGroup::GeminiPro
        } else {
            QuotaGroup::GeminiFlash
        }
    } else {
        QuotaGroup::Claude
    }
}
