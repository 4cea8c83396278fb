//! Generation gateway: the outbound model call behind the chat pipeline.

pub mod vertex;

use serde::Deserialize;

use crate::error::GenerationError;

pub use self::vertex::VertexGateway;

/// Text plus usage produced by one successful generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: f64,
}

#[async_trait::async_trait]
pub trait GenerationGateway: Send + Sync {
    /// Model identity reported on spans and logs.
    fn model(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        request_id: &str,
    ) -> Result<GenerationOutcome, GenerationError>;
}

/// A token count reported either as one number or as per-segment numbers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenCount {
    One(u64),
    Many(Vec<u64>),
}

impl TokenCount {
    pub fn total(&self) -> u64 {
        match self {
            TokenCount::One(n) => *n,
            TokenCount::Many(parts) => parts.iter().sum(),
        }
    }
}

/// Usage block as returned by the provider.  Every field is optional; the
/// provider has shipped several shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    pub prompt_token_count: Option<TokenCount>,
    pub prompt_token_counts: Option<TokenCount>,
    pub candidates_token_count: Option<TokenCount>,
    pub candidates_token_counts: Option<TokenCount>,
    pub total_token_count: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl UsageMetadata {
    /// Lenient parse of a raw usage object; anything unreadable counts as
    /// no usage at all.
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        match value {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone()).unwrap_or_else(|err| {
                tracing::debug!(error = %err, "unreadable usage metadata, reporting zero tokens");
                UsageMetadata::default()
            }),
            _ => UsageMetadata::default(),
        }
    }

    /// Input: scalar count, else summed list, else 0.
    /// Output: scalar count, else summed list, else `total - input` floored
    /// at 0, else 0.
    pub fn token_usage(&self) -> TokenUsage {
        let tokens_in = self
            .prompt_token_count
            .as_ref()
            .or(self.prompt_token_counts.as_ref())
            .map(TokenCount::total)
            .unwrap_or(0);
        let tokens_out = self
            .candidates_token_count
            .as_ref()
            .or(self.candidates_token_counts.as_ref())
            .map(TokenCount::total)
            .or_else(|| self.total_token_count.map(|t| t.saturating_sub(tokens_in)))
            .unwrap_or(0);
        TokenUsage {
            tokens_in,
            tokens_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn usage(v: serde_json::Value) -> TokenUsage {
        UsageMetadata::from_value(Some(&v)).token_usage()
    }

    #[test]
    fn scalar_counts_are_used_directly() {
        let u = usage(json!({"promptTokenCount": 42, "candidatesTokenCount": 17, "totalTokenCount": 59}));
        assert_eq!(u, TokenUsage { tokens_in: 42, tokens_out: 17 });
    }

    #[test]
    fn list_counts_are_summed() {
        let u = usage(json!({"promptTokenCounts": [10, 5, 3], "candidatesTokenCounts": [4, 4]}));
        assert_eq!(u, TokenUsage { tokens_in: 18, tokens_out: 8 });
    }

    #[test]
    fn output_is_estimated_from_total() {
        let u = usage(json!({"promptTokenCount": 30, "totalTokenCount": 45}));
        assert_eq!(u, TokenUsage { tokens_in: 30, tokens_out: 15 });
        let u = usage(json!({"promptTokenCount": 50, "totalTokenCount": 45}));
        assert_eq!(u.tokens_out, 0);
    }

    #[test]
    fn missing_or_malformed_usage_is_zero() {
        assert_eq!(UsageMetadata::from_value(None).token_usage(), TokenUsage::default());
        assert_eq!(usage(json!(null)), TokenUsage::default());
        assert_eq!(usage(json!({})), TokenUsage::default());
        assert_eq!(usage(json!({"promptTokenCount": "many"})), TokenUsage::default());
    }
}
