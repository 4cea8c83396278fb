//! Core library for the watchtower chat service.  This module wires the
//! request orchestrator, the telemetry recorder and the HTTP handlers
//! together; `main.rs` only boots the server.

mod config;
pub mod error;
pub mod faults;
pub mod gateway;
pub mod logging;
pub mod orchestrator;
pub mod security;
pub mod telemetry;

pub use config::{AppConfig, LogConfig, LogFormat, TelemetryConfig};

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    DefaultBodyLimit, Query, State,
};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::{ChatError, ErrorResponse};
use crate::faults::FaultInjector;
use crate::gateway::{GenerationGateway, VertexGateway};
use crate::orchestrator::{ChatRequest, Orchestrator};
use crate::security::SecurityAnalyzer;
use crate::telemetry::{
    JsonlSpanExporter, LogSpanExporter, Resource, RotatingFile, SpanExporter, Telemetry,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// `None` when the generation gateway could not be constructed.
    pub orchestrator: Option<Arc<Orchestrator>>,
    pub telemetry: Arc<Telemetry>,
    pub service_name: String,
    pub max_request_bytes: Option<usize>,
    pub unavailable_reason: Option<String>,
    /// Present when spans are written to a JSONL file.
    pub span_file: Option<Arc<JsonlSpanExporter>>,
}

/// Assemble the state from an already-loaded configuration.  The gateway is
/// passed in so callers (and tests) decide which backend serves generation.
pub fn build_state(
    config: &AppConfig,
    gateway: Result<Arc<dyn GenerationGateway>, ChatError>,
    exporter: Arc<dyn SpanExporter>,
) -> AppState {
    let telemetry = Arc::new(Telemetry::new(exporter));
    let analyzer = Arc::new(SecurityAnalyzer::new(&config.security));
    let faults = FaultInjector::new(config.faults.clone());

    let (orchestrator, unavailable_reason) = match gateway {
        Ok(gateway) => {
            let orchestrator = Orchestrator::new(
                analyzer,
                faults,
                Arc::clone(&telemetry),
                gateway,
                Duration::from_millis(config.gemini.timeout_ms),
            );
            (Some(Arc::new(orchestrator)), None)
        }
        Err(err) => {
            tracing::warn!(error = %err, "generation gateway unavailable; chat requests will be rejected");
            let reason = match err {
                ChatError::Configuration(reason) => reason,
                other => other.to_string(),
            };
            (None, Some(reason))
        }
    };

    AppState {
        orchestrator,
        telemetry,
        service_name: config.telemetry.service_name.clone(),
        max_request_bytes: config.max_request_bytes,
        unavailable_reason,
        span_file: None,
    }
}

/// Build state from environment variables.  See `AppConfig::from_env` for
/// the variables read.  Spans go to `SPAN_LOG_FILE` when it is set and
/// can be opened, otherwise to the log.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;

    tracing::info!(
        endpoint = %config.telemetry.otlp_endpoint,
        header_count = config.telemetry.otlp_headers.len(),
        service = %config.telemetry.service_name,
        environment = %config.telemetry.environment,
        "telemetry backend configured"
    );

    let span_file = match config.telemetry.span_log_file.as_deref() {
        Some(path) => match RotatingFile::open(path, config.telemetry.rotation.clone()) {
            Ok(file) => {
                let resource = Resource {
                    service_name: config.telemetry.service_name.clone(),
                    service_version: env!("CARGO_PKG_VERSION").to_string(),
                    environment: config.telemetry.environment.clone(),
                };
                Some(Arc::new(JsonlSpanExporter::new(file, resource)))
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Failed to open SPAN_LOG_FILE; spans go to the log");
                None
            }
        },
        None => None,
    };
    let exporter: Arc<dyn SpanExporter> = match &span_file {
        Some(file) => Arc::clone(file) as Arc<dyn SpanExporter>,
        None => Arc::new(LogSpanExporter),
    };

    let gateway = VertexGateway::new(&config.gemini)
        .map(|gw| Arc::new(gw) as Arc<dyn GenerationGateway>);

    let mut state = build_state(&config, gateway, exporter);
    state.span_file = span_file;
    Ok(state)
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/chat", post(chat_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct ChatBody {
    #[serde(default, alias = "sessionId")]
    session_id: String,
    #[serde(default)]
    message: String,
    #[serde(default, alias = "slowMode")]
    slow_mode: Option<bool>,
    #[serde(default, alias = "simulateFailure")]
    simulate_failure: Option<bool>,
}

/// Query overrides; these win over the same fields in the body.
#[derive(Debug, Default, Deserialize)]
struct ChatQuery {
    slow_mode: Option<bool>,
    simulate_failure: Option<bool>,
}

async fn chat_handler(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };

    let Some(orchestrator) = state.orchestrator.as_ref() else {
        let reason = state
            .unavailable_reason
            .clone()
            .unwrap_or_else(|| "generation gateway not configured".to_string());
        let err = ChatError::Configuration(reason);
        state.telemetry.record_failure();
        tracing::error!(
            session_id = %body.session_id,
            error_kind = err.kind(),
            error = %err,
            "Chat request rejected"
        );
        return err.into_response();
    };

    let req = ChatRequest {
        session_id: body.session_id,
        message: body.message,
        slow_mode: query.slow_mode.or(body.slow_mode),
        simulate_failure: query.simulate_failure.or(body.simulate_failure),
    };

    match orchestrator.handle(req).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(failure) => failure.into_response(),
    }
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection) -> axum::response::Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            let detail = match state.max_request_bytes {
                Some(limit) => {
                    tracing::warn!(limit, "request body exceeded configured limit");
                    format!("Request too large (body exceeded limit {} bytes)", limit)
                }
                None => {
                    tracing::warn!("request body exceeded limit but no max_request_bytes configured");
                    "Request too large".to_string()
                }
            };
            let body = ErrorResponse {
                error: "payload_too_large",
                detail,
                http_status: StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
                request_id: None,
            };
            (StatusCode::PAYLOAD_TOO_LARGE, Json(body)).into_response()
        }
        other => other.into_response(),
    }
}

/// Liveness plus whether generation is actually available.
async fn health_handler(State(state): State<AppState>) -> axum::response::Response {
    let json = serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
        "generation_available": state.orchestrator.is_some(),
        "model": state.orchestrator.as_ref().map(|o| o.model().to_string()),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    use std::fmt::Write as _;

    let mut buf = state.telemetry.render_prometheus();
    if let Some(file) = &state.span_file {
        writeln!(
            &mut buf,
            "# HELP watchtower_span_lines_total Span JSON lines written\n# TYPE watchtower_span_lines_total counter\nwatchtower_span_lines_total {}",
            file.lines_total()
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP watchtower_span_write_errors_total Span JSON line write failures\n# TYPE watchtower_span_write_errors_total counter\nwatchtower_span_write_errors_total {}",
            file.write_errors_total()
        )
        .ok();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
