//! Telemetry recorder: the fixed instrument set, the span factory and the
//! stage-level recording calls the orchestrator makes.
//!
//! Instruments are created once in `Instruments::new` and never replaced, so
//! call sites use them unconditionally.

pub mod export;
pub mod metrics;
pub mod spans;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use crate::gateway::GenerationOutcome;
use crate::security::SecurityFinding;

pub use self::export::{JsonlSpanExporter, Resource, RotatingFile, RotationConfig};
pub use self::metrics::{CategoryCounter, Counter, Histogram};
pub use self::spans::{
    AttributeValue, FinishedSpan, InMemorySpanExporter, LogSpanExporter, RequestSpan, SpanExporter,
    SpanFactory, SpanStatus,
};

/// Every instrument the service reports into.
pub struct Instruments {
    pub requests: Counter,
    pub request_latency: Histogram,
    pub generation_latency: Histogram,
    pub tokens_in: Counter,
    pub tokens_out: Counter,
    pub failures: Counter,
    pub prompt_injections: Counter,
    pub pii_detections: Counter,
    pub pii_detections_by_type: CategoryCounter,
}

impl Instruments {
    pub fn new() -> Self {
        Self {
            requests: Counter::new("llm.requests.total", "Total number of LLM requests"),
            request_latency: Histogram::new(
                "llm.request.latency",
                "Request latency in milliseconds",
            ),
            generation_latency: Histogram::new(
                "llm.generate.latency",
                "LLM generation latency in milliseconds",
            ),
            tokens_in: Counter::new("llm.tokens.input", "Total input tokens"),
            tokens_out: Counter::new("llm.tokens.output", "Total output tokens"),
            failures: Counter::new("llm.failures.total", "Total number of LLM failures"),
            prompt_injections: Counter::new(
                "llm.security.prompt_injection",
                "Number of prompt injection attempts detected",
            ),
            pii_detections: Counter::new(
                "llm.security.pii_detected",
                "Number of PII matches detected",
            ),
            pii_detections_by_type: CategoryCounter::new(
                "llm.security.pii_detected",
                "Number of PII matches detected per category",
                "pii_type",
            ),
        }
    }
}

impl Default for Instruments {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Telemetry {
    instruments: Instruments,
    spans: SpanFactory,
    started: Instant,
}

impl Telemetry {
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            instruments: Instruments::new(),
            spans: SpanFactory::new(exporter),
            started: Instant::now(),
        }
    }

    pub fn instruments(&self) -> &Instruments {
        &self.instruments
    }

    pub fn spans(&self) -> &SpanFactory {
        &self.spans
    }

    /// Security counters for one analysed prompt.
    pub fn record_security(&self, finding: &SecurityFinding) {
        if finding.injection_detected {
            self.instruments.prompt_injections.add(1);
        }
        if finding.pii_detected() {
            self.instruments
                .pii_detections
                .add(finding.pii_total() as u64);
            for (category, count) in &finding.pii_counts {
                self.instruments
                    .pii_detections_by_type
                    .add(*category, *count as u64);
            }
        }
    }

    pub fn record_generation(&self, outcome: &GenerationOutcome) {
        self.instruments.tokens_in.add(outcome.tokens_in);
        self.instruments.tokens_out.add(outcome.tokens_out);
        self.instruments
            .generation_latency
            .record(outcome.latency_ms);
    }

    pub fn record_completion(&self, total_latency_ms: f64) {
        self.instruments.requests.add(1);
        self.instruments.request_latency.record(total_latency_ms);
    }

    pub fn record_failure(&self) {
        self.instruments.failures.add(1);
    }

    /// Prometheus text exposition of every instrument plus process gauges.
    pub fn render_prometheus(&self) -> String {
        let i = &self.instruments;
        let mut buf = String::new();
        i.requests.render(&mut buf);
        i.request_latency.render(&mut buf);
        i.generation_latency.render(&mut buf);
        i.tokens_in.render(&mut buf);
        i.tokens_out.render(&mut buf);
        i.failures.render(&mut buf);
        i.prompt_injections.render(&mut buf);
        i.pii_detections.render(&mut buf);
        i.pii_detections_by_type.render(&mut buf);
        writeln!(
            &mut buf,
            "# HELP watchtower_build_info Build information\n# TYPE watchtower_build_info gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "watchtower_build_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP watchtower_process_uptime_seconds Process uptime seconds\n# TYPE watchtower_process_uptime_seconds gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "watchtower_process_uptime_seconds {}",
            self.started.elapsed().as_secs_f64()
        )
        .ok();
        buf
    }
}
