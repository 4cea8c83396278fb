//! Request orchestrator.
//!
//! One chat request moves through
//! `FaultGate -> SecurityCheck -> SlowGate -> Generate` and ends in exactly one
//! of `Completed`, `FailedSimulated` or `FailedGeneration`.  Every terminal
//! failure goes through `fail`, which is the only place the failure counter
//! is incremented, so each failed request counts once.  A panic anywhere in
//! the pipeline is caught at the task boundary in `handle` and reported as
//! an unexpected error through the same bookkeeping.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{ChatError, GenerationError};
use crate::faults::FaultInjector;
use crate::gateway::{GenerationGateway, GenerationOutcome};
use crate::security::{SecurityAnalyzer, SecurityFinding};
use crate::telemetry::{RequestSpan, Telemetry};

pub const CHAT_METHOD: &str = "POST";
pub const CHAT_ROUTE: &str = "/chat";

pub const ROOT_SPAN: &str = "chat.request";
pub const SECURITY_SPAN: &str = "security.check";
pub const GENERATION_SPAN: &str = "llm.request";

/// One inbound chat message with its optional fault overrides.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    pub slow_mode: Option<bool>,
    pub simulate_failure: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub response: String,
    pub request_id: String,
}

/// A failed request, still carrying its id for the caller.
#[derive(Debug)]
pub struct ChatFailure {
    pub request_id: String,
    pub error: ChatError,
}

impl IntoResponse for ChatFailure {
    fn into_response(self) -> Response {
        self.error.into_response_for(Some(self.request_id))
    }
}

/// Per-request identity and clock.  Lives exactly as long as the request.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub session_id: String,
    started: Instant,
}

impl RequestContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            session_id: session_id.into(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

pub struct Orchestrator {
    analyzer: Arc<SecurityAnalyzer>,
    faults: FaultInjector,
    telemetry: Arc<Telemetry>,
    gateway: Arc<dyn GenerationGateway>,
    generation_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        analyzer: Arc<SecurityAnalyzer>,
        faults: FaultInjector,
        telemetry: Arc<Telemetry>,
        gateway: Arc<dyn GenerationGateway>,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            analyzer,
            faults,
            telemetry,
            gateway,
            generation_timeout,
        }
    }

    pub fn model(&self) -> &str {
        self.gateway.model()
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Process one request on its own task so a panic in any stage is
    /// contained and still answered.
    pub async fn handle(self: &Arc<Self>, req: ChatRequest) -> Result<ChatReply, ChatFailure> {
        let ctx = RequestContext::new(req.session_id.clone());
        let request_id = ctx.request_id.to_string();
        let session_id = ctx.session_id.clone();
        let started = ctx.started;

        let this = Arc::clone(self);
        match tokio::spawn(async move { this.run(ctx, req).await }).await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let cause = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "request task cancelled".to_string()
                };
                self.telemetry.record_failure();
                tracing::error!(
                    request_id = %request_id,
                    session_id = %session_id,
                    latency_ms = started.elapsed().as_secs_f64() * 1000.0,
                    error_kind = "unexpected_error",
                    error = %cause,
                    "Unexpected error in chat pipeline"
                );
                Err(ChatFailure {
                    request_id,
                    error: ChatError::Unexpected(cause),
                })
            }
        }
    }

    async fn run(&self, ctx: RequestContext, req: ChatRequest) -> Result<ChatReply, ChatFailure> {
        let request_id = ctx.request_id.to_string();

        // FaultGate
        let decision = self.faults.resolve(req.simulate_failure, req.slow_mode);
        if decision.simulate_failure {
            return Err(self.fail(&ctx, None, ChatError::SimulatedFailure));
        }

        let mut root = self.telemetry.spans().root(ROOT_SPAN, &request_id);

        let finding = self.security_check(&root, &req.message);

        // SlowGate
        if let Some(delay) = decision.delay() {
            tokio::time::sleep(delay)
                .instrument(root.tracing_span().clone())
                .await;
            root.tracing_span().in_scope(|| {
                tracing::info!(request_id = %request_id, delay_ms = decision.delay_ms, "Slow mode delay injected");
            });
        }

        let outcome = match self.generate(&root, &request_id, &req.message).await {
            Ok(outcome) => outcome,
            Err(err) => {
                root.set_error(err.to_string());
                return Err(self.fail(&ctx, Some(&root), err));
            }
        };

        // Completed
        let total_latency_ms = ctx.elapsed_ms();
        root.set_attribute("http.method", CHAT_METHOD);
        root.set_attribute("http.route", CHAT_ROUTE);
        root.set_attribute("session_id", ctx.session_id.as_str());
        root.set_attribute("request_id", request_id.as_str());
        root.set_attribute("llm.model", self.model());
        root.set_attribute("request.latency_ms", total_latency_ms);
        root.set_attribute("security.prompt_injection", finding.injection_detected);
        root.set_attribute("security.pii_detected", finding.pii_detected());
        root.set_attribute("security.prompt_hash", finding.content_hash.as_str());
        root.set_attribute("llm.tokens_in", outcome.tokens_in);
        root.set_attribute("llm.tokens_out", outcome.tokens_out);

        self.telemetry.record_completion(total_latency_ms);

        let pii_types = serde_json::to_string(&finding.pii_counts).unwrap_or_default();
        root.tracing_span().in_scope(|| {
            tracing::info!(
                request_id = %request_id,
                trace_id = %root.trace_id(),
                session_id = %ctx.session_id,
                model = %self.model(),
                latency_ms = total_latency_ms,
                llm_latency_ms = outcome.latency_ms,
                tokens_in = outcome.tokens_in,
                tokens_out = outcome.tokens_out,
                prompt_injection = finding.injection_detected,
                pii_detected = finding.pii_detected(),
                pii_types = %pii_types,
                prompt_hash = %finding.content_hash,
                prompt_preview = %finding.preview,
                "Request completed successfully"
            );
        });
        root.end();

        Ok(ChatReply {
            response: outcome.text,
            request_id,
        })
    }

    fn security_check(&self, root: &RequestSpan, message: &str) -> SecurityFinding {
        let mut span = root.child(SECURITY_SPAN);
        let finding = span
            .tracing_span()
            .in_scope(|| self.analyzer.analyze(message));

        span.set_attribute("security.prompt_injection", finding.injection_detected);
        span.set_attribute("security.pii_detected", finding.pii_detected());
        span.set_attribute("security.prompt_hash", finding.content_hash.as_str());
        span.set_attribute("security.pii_types", finding.pii_category_list());
        self.telemetry.record_security(&finding);

        if finding.injection_detected {
            span.tracing_span().in_scope(|| {
                tracing::debug!(
                    rule = self.analyzer.matched_rule(message).unwrap_or("unknown"),
                    prompt_hash = %finding.content_hash,
                    "prompt injection pattern matched"
                );
            });
        }
        span.end();
        finding
    }

    async fn generate(
        &self,
        root: &RequestSpan,
        request_id: &str,
        message: &str,
    ) -> Result<GenerationOutcome, ChatError> {
        let mut span = root.child(GENERATION_SPAN);
        span.set_attribute("llm.model", self.model());

        let call = tokio::time::timeout(
            self.generation_timeout,
            self.gateway.generate(message, request_id),
        )
        .instrument(span.tracing_span().clone())
        .await;
        let result = call.unwrap_or_else(|_| {
            Err(GenerationError::Timeout(
                self.generation_timeout.as_millis() as u64,
            ))
        });

        match result {
            Ok(outcome) => {
                span.set_attribute("llm.tokens_in", outcome.tokens_in);
                span.set_attribute("llm.tokens_out", outcome.tokens_out);
                span.set_attribute("llm.latency_ms", outcome.latency_ms);
                self.telemetry.record_generation(&outcome);
                Ok(outcome)
            }
            Err(err) => {
                span.record_error(&err);
                span.set_error(err.to_string());
                Err(ChatError::Generation(err))
            }
        }
    }

    /// Single bookkeeping point for terminal failures: one failure increment
    /// and one structured record, emitted inside the root span when one is open.
    fn fail(&self, ctx: &RequestContext, root: Option<&RequestSpan>, error: ChatError) -> ChatFailure {
        self.telemetry.record_failure();
        let request_id = ctx.request_id.to_string();
        let trace_id = root.map(RequestSpan::trace_id).unwrap_or_default();
        let _entered = root.map(|r| r.tracing_span().enter());
        match &error {
            ChatError::SimulatedFailure => {
                tracing::warn!(
                    request_id = %request_id,
                    session_id = %ctx.session_id,
                    error_kind = error.kind(),
                    "Simulating failure for request"
                );
            }
            _ => {
                tracing::error!(
                    request_id = %request_id,
                    trace_id = %trace_id,
                    session_id = %ctx.session_id,
                    latency_ms = ctx.elapsed_ms(),
                    error_kind = error.kind(),
                    error = %error.cause(),
                    "Chat request failed"
                );
            }
        }
        ChatFailure { request_id, error }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in chat pipeline".to_string()
    }
}
