use std::time::Instant;

use serde_json::Value;

use super::{GenerationGateway, GenerationOutcome, UsageMetadata};
use crate::error::{ChatError, GenerationError};

pub const DEFAULT_LOCATION: &str = "us-central1";
pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";
pub const DEFAULT_GENERATION_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiConfig {
    pub project_id: Option<String>,
    pub location: String,
    pub model: String,
    /// Base URL override; defaults to the regional Vertex AI host.
    pub endpoint: Option<String>,
    pub access_token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            location: DEFAULT_LOCATION.to_string(),
            model: DEFAULT_MODEL.to_string(),
            endpoint: None,
            access_token: None,
            timeout_ms: DEFAULT_GENERATION_TIMEOUT_MS,
        }
    }
}

/// Gemini on Vertex AI via the REST `generateContent` method.
pub struct VertexGateway {
    client: reqwest::Client,
    url: String,
    model: String,
    access_token: Option<String>,
}

impl VertexGateway {
    pub fn new(cfg: &GeminiConfig) -> Result<Self, ChatError> {
        let project = cfg
            .project_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                ChatError::Configuration(
                    "GOOGLE_CLOUD_PROJECT environment variable must be set".into(),
                )
            })?;
        let base = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com", cfg.location));
        let url = format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
            base.trim_end_matches('/'),
            project,
            cfg.location,
            cfg.model
        );
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ChatError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        tracing::info!(project_id = %project, location = %cfg.location, model = %cfg.model, "Gemini client initialized");
        Ok(Self {
            client,
            url,
            model: cfg.model.clone(),
            access_token: cfg.access_token.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, prompt: &str) -> Result<Value, GenerationError> {
        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }]
        });
        let mut rb = self.client.post(&self.url).json(&body);
        if let Some(tok) = &self.access_token {
            rb = rb.bearer_auth(tok);
        }
        let resp = rb.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| GenerationError::Decode(e.to_string()))
    }
}

/// Concatenated text parts of the first candidate; empty when absent.
fn response_text(body: &Value) -> String {
    body.pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl GenerationGateway for VertexGateway {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &str,
        request_id: &str,
    ) -> Result<GenerationOutcome, GenerationError> {
        let start = Instant::now();
        match self.call(prompt).await {
            Ok(body) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                let usage = UsageMetadata::from_value(body.get("usageMetadata")).token_usage();
                tracing::info!(
                    request_id = %request_id,
                    model = %self.model,
                    latency_ms,
                    tokens_in = usage.tokens_in,
                    tokens_out = usage.tokens_out,
                    "LLM request completed"
                );
                Ok(GenerationOutcome {
                    text: response_text(&body),
                    tokens_in: usage.tokens_in,
                    tokens_out: usage.tokens_out,
                    latency_ms,
                })
            }
            Err(err) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                tracing::error!(
                    request_id = %request_id,
                    model = %self.model,
                    latency_ms,
                    error = %err,
                    "LLM request failed"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_project_is_configuration_error() {
        let err = VertexGateway::new(&GeminiConfig::default())
            .err()
            .expect("gateway without project must fail");
        assert!(matches!(err, ChatError::Configuration(_)));
    }

    #[test]
    fn builds_regional_generate_url() {
        let cfg = GeminiConfig {
            project_id: Some("proj".into()),
            ..GeminiConfig::default()
        };
        let gw = VertexGateway::new(&cfg).unwrap();
        assert_eq!(
            gw.url(),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/proj/locations/us-central1/publishers/google/models/gemini-1.5-pro:generateContent"
        );
        assert_eq!(gw.model(), "gemini-1.5-pro");
    }

    #[test]
    fn joins_text_parts_of_first_candidate() {
        let body = json!({
            "candidates": [
                {"content": {"parts": [{"text": "Hello, "}, {"text": "world"}]}},
                {"content": {"parts": [{"text": "ignored"}]}}
            ]
        });
        assert_eq!(response_text(&body), "Hello, world");
        assert_eq!(response_text(&json!({"candidates": []})), "");
    }
}
