use std::env;
use std::fs;

use anyhow::{anyhow, Context, Result};

use crate::faults::{FaultConfig, DEFAULT_SLOW_MODE_DELAY_MS};
use crate::gateway::vertex::{
    GeminiConfig, DEFAULT_GENERATION_TIMEOUT_MS, DEFAULT_LOCATION, DEFAULT_MODEL,
};
use crate::security::SecurityConfig;
use crate::telemetry::RotationConfig;

pub const DEFAULT_SERVICE_NAME: &str = "llm-ops-watchtower";
pub const DEFAULT_OTLP_ENDPOINT: &str = "https://api.datadoghq.com";
pub const DEFAULT_ENVIRONMENT: &str = "production";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: String,
    pub otlp_headers: Vec<(String, String)>,
    pub environment: String,
    /// JSONL destination for finished spans; spans go to the log when unset.
    pub span_log_file: Option<String>,
    pub rotation: RotationConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            otlp_headers: Vec::new(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            span_log_file: None,
            rotation: RotationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    /// Read separately from `AppConfig` so logging is up before the rest of
    /// the configuration is parsed.
    pub fn from_env() -> Result<Self> {
        let level = non_empty_env("LOG_LEVEL")
            .map(|l| l.to_lowercase())
            .unwrap_or_else(|| "info".into());
        let format = match non_empty_env("LOG_FORMAT").map(|f| f.to_lowercase()).as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("text") | Some("pretty") => LogFormat::Text,
            Some(other) => return Err(anyhow!("LOG_FORMAT must be json or text, got '{}'", other)),
        };
        Ok(Self { level, format })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub faults: FaultConfig,
    pub gemini: GeminiConfig,
    pub telemetry: TelemetryConfig,
    pub log: LogConfig,
    pub security: SecurityConfig,
    pub max_request_bytes: Option<usize>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let security = if let Ok(path) = env::var("WATCHTOWER_SECURITY_CONFIG") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!(
                    "Failed to read WATCHTOWER_SECURITY_CONFIG '{}': file unreadable",
                    path
                )
            })?;
            serde_json::from_str::<SecurityConfig>(&content).with_context(|| {
                format!(
                    "Failed to parse WATCHTOWER_SECURITY_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            SecurityConfig::default()
        };

        let faults = FaultConfig {
            failure_mode: parse_bool_env("ENABLE_FAILURE_MODE")?.unwrap_or(false),
            slow_mode: parse_bool_env("ENABLE_SLOW_MODE")?.unwrap_or(false),
            slow_mode_delay_ms: parse_delay_ms(env::var("SLOW_MODE_DELAY_MS").ok().as_deref()),
        };

        let gemini = GeminiConfig {
            project_id: non_empty_env("GOOGLE_CLOUD_PROJECT"),
            location: non_empty_env("VERTEX_LOCATION").unwrap_or_else(|| DEFAULT_LOCATION.into()),
            model: non_empty_env("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
            endpoint: non_empty_env("VERTEX_ENDPOINT"),
            access_token: non_empty_env("VERTEX_ACCESS_TOKEN"),
            timeout_ms: parse_optional_u64("GENERATION_TIMEOUT_MS")?
                .unwrap_or(DEFAULT_GENERATION_TIMEOUT_MS),
        };

        let telemetry = TelemetryConfig {
            service_name: non_empty_env("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.into()),
            otlp_endpoint: non_empty_env("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.into()),
            otlp_headers: parse_headers(&env::var("OTEL_EXPORTER_OTLP_HEADERS").unwrap_or_default()),
            environment: non_empty_env("DEPLOYMENT_ENVIRONMENT")
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.into()),
            span_log_file: non_empty_env("SPAN_LOG_FILE"),
            rotation: RotationConfig {
                max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
                keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
                compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
            },
        };

        let log = LogConfig::from_env()?;

        let max_request_bytes =
            parse_optional_u64("WATCHTOWER_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        Ok(Self {
            faults,
            gemini,
            telemetry,
            log,
            security,
            max_request_bytes,
        })
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Unset or unparseable delays fall back to the default instead of failing.
fn parse_delay_ms(raw: Option<&str>) -> u64 {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => DEFAULT_SLOW_MODE_DELAY_MS,
        Some(v) => v.parse::<u64>().unwrap_or_else(|_| {
            tracing::warn!(value = %v, default = DEFAULT_SLOW_MODE_DELAY_MS, "invalid SLOW_MODE_DELAY_MS, using default");
            DEFAULT_SLOW_MODE_DELAY_MS
        }),
    }
}

/// `key=value` pairs separated by commas; entries without `=` are skipped.
fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
