//! Nested request spans.
//!
//! A `RequestSpan` collects attributes, status and recorded errors while its
//! stage runs and hands a `FinishedSpan` to the configured `SpanExporter`
//! exactly once, when it is ended or dropped.  Each span also enters a
//! `tracing` span of the same name so log lines emitted inside a stage carry
//! the request id.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttributeValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Float(f) => Some(*f),
            AttributeValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<u64> for AttributeValue {
    fn from(v: u64) -> Self {
        AttributeValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Str(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Str(v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", content = "message", rename_all = "lowercase")]
pub enum SpanStatus {
    Unset,
    Error(String),
}

/// Immutable record of a closed span.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedSpan {
    pub name: &'static str,
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub attributes: BTreeMap<&'static str, AttributeValue>,
    pub status: SpanStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub duration_ms: f64,
}

impl FinishedSpan {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, SpanStatus::Error(_))
    }
}

/// Destination for closed spans (the tracing backend).
pub trait SpanExporter: Send + Sync {
    fn export(&self, span: FinishedSpan);
}

/// Writes each closed span as a debug-level structured event.
#[derive(Debug, Default)]
pub struct LogSpanExporter;

impl SpanExporter for LogSpanExporter {
    fn export(&self, span: FinishedSpan) {
        let attributes = serde_json::to_string(&span.attributes).unwrap_or_default();
        tracing::debug!(
            target: "spans",
            span_name = span.name,
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            parent_span_id = ?span.parent_span_id,
            duration_ms = span.duration_ms,
            error = span.is_error(),
            attributes = %attributes,
            "span finished"
        );
    }
}

/// Keeps every closed span in memory.
#[derive(Debug, Default)]
pub struct InMemorySpanExporter {
    spans: Mutex<Vec<FinishedSpan>>,
}

impl InMemorySpanExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<FinishedSpan> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// All finished spans with the given name, oldest first.
    pub fn named(&self, name: &str) -> Vec<FinishedSpan> {
        self.spans()
            .into_iter()
            .filter(|s| s.name == name)
            .collect()
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&self, span: FinishedSpan) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.push(span);
        }
    }
}

/// Starts root spans bound to one exporter.
#[derive(Clone)]
pub struct SpanFactory {
    exporter: Arc<dyn SpanExporter>,
}

impl SpanFactory {
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self { exporter }
    }

    pub fn root(&self, name: &'static str, request_id: &str) -> RequestSpan {
        let trace_id = Uuid::new_v4().simple().to_string();
        let tracing_span = tracing::info_span!(
            "chat",
            stage = name,
            request_id = %request_id,
            trace_id = %trace_id
        );
        RequestSpan::start(
            name,
            request_id.to_string(),
            trace_id,
            None,
            tracing_span,
            self.exporter.clone(),
        )
    }
}

pub struct RequestSpan {
    name: &'static str,
    request_id: String,
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    attributes: BTreeMap<&'static str, AttributeValue>,
    status: SpanStatus,
    errors: Vec<String>,
    started: Instant,
    tracing_span: tracing::Span,
    exporter: Arc<dyn SpanExporter>,
}

impl RequestSpan {
    fn start(
        name: &'static str,
        request_id: String,
        trace_id: String,
        parent_span_id: Option<String>,
        tracing_span: tracing::Span,
        exporter: Arc<dyn SpanExporter>,
    ) -> Self {
        let mut span_id = Uuid::new_v4().simple().to_string();
        span_id.truncate(16);
        Self {
            name,
            request_id,
            trace_id,
            span_id,
            parent_span_id,
            attributes: BTreeMap::new(),
            status: SpanStatus::Unset,
            errors: Vec::new(),
            started: Instant::now(),
            tracing_span,
            exporter,
        }
    }

    /// Child span in the same trace, nested under this one.  Its `tracing`
    /// span repeats the request and trace ids so stage logs correlate alone.
    pub fn child(&self, name: &'static str) -> RequestSpan {
        let tracing_span = tracing::info_span!(
            parent: &self.tracing_span,
            "chat",
            stage = name,
            request_id = %self.request_id,
            trace_id = %self.trace_id
        );
        RequestSpan::start(
            name,
            self.request_id.clone(),
            self.trace_id.clone(),
            Some(self.span_id.clone()),
            tracing_span,
            self.exporter.clone(),
        )
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn set_attribute(&mut self, key: &'static str, value: impl Into<AttributeValue>) {
        self.attributes.insert(key, value.into());
    }

    pub fn record_error(&mut self, err: &dyn fmt::Display) {
        self.errors.push(err.to_string());
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status = SpanStatus::Error(message.into());
    }

    /// The `tracing` span to enter or instrument futures with.
    pub fn tracing_span(&self) -> &tracing::Span {
        &self.tracing_span
    }

    pub fn end(self) {
        drop(self)
    }
}

impl Drop for RequestSpan {
    fn drop(&mut self) {
        // Unwinding through an open span means its stage never finished.
        if std::thread::panicking() && matches!(self.status, SpanStatus::Unset) {
            self.status = SpanStatus::Error("panic in chat pipeline".to_string());
        }
        let finished = FinishedSpan {
            name: self.name,
            trace_id: std::mem::take(&mut self.trace_id),
            span_id: std::mem::take(&mut self.span_id),
            parent_span_id: self.parent_span_id.take(),
            attributes: std::mem::take(&mut self.attributes),
            status: std::mem::replace(&mut self.status, SpanStatus::Unset),
            errors: std::mem::take(&mut self.errors),
            duration_ms: self.started.elapsed().as_secs_f64() * 1000.0,
        };
        self.exporter.export(finished);
    }
}
