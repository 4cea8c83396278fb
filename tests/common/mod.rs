#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use watchtower::error::{ChatError, GenerationError};
use watchtower::gateway::{GenerationGateway, GenerationOutcome};
use watchtower::telemetry::InMemorySpanExporter;
use watchtower::{app, build_state, AppConfig, AppState};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

pub const STUB_MODEL: &str = "stub-model";
pub const STUB_REPLY: &str = "Hello from the stub";

#[derive(Debug, Clone)]
pub enum StubBehavior {
    Reply,
    Fail(String),
    /// Sleep before replying.
    Delay(Duration),
    Panic,
}

/// Scriptable generation backend reporting 42 input and 17 output tokens.
pub struct StubGateway {
    behavior: StubBehavior,
    calls: AtomicUsize,
}

impl StubGateway {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl GenerationGateway for StubGateway {
    fn model(&self) -> &str {
        STUB_MODEL
    }

    async fn generate(
        &self,
        prompt: &str,
        _request_id: &str,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            StubBehavior::Reply => {}
            StubBehavior::Fail(msg) => return Err(GenerationError::Backend(msg.clone())),
            StubBehavior::Delay(d) => tokio::time::sleep(*d).await,
            StubBehavior::Panic => panic!("stub gateway exploded on {:?}", prompt),
        }
        Ok(GenerationOutcome {
            text: STUB_REPLY.to_string(),
            tokens_in: 42,
            tokens_out: 17,
            latency_ms: 12.5,
        })
    }
}

pub struct Harness {
    pub state: AppState,
    pub spans: Arc<InMemorySpanExporter>,
    pub gateway: Arc<StubGateway>,
}

pub fn harness(config: AppConfig, behavior: StubBehavior) -> Harness {
    let spans = Arc::new(InMemorySpanExporter::new());
    let gateway = Arc::new(StubGateway::new(behavior));
    let state = build_state(
        &config,
        Ok(gateway.clone() as Arc<dyn GenerationGateway>),
        spans.clone(),
    );
    Harness {
        state,
        spans,
        gateway,
    }
}

/// State whose gateway failed to initialise.
pub fn unavailable_harness(config: AppConfig) -> (AppState, Arc<InMemorySpanExporter>) {
    let spans = Arc::new(InMemorySpanExporter::new());
    let state = build_state(
        &config,
        Err(ChatError::Configuration(
            "GOOGLE_CLOUD_PROJECT environment variable must be set".into(),
        )),
        spans.clone(),
    );
    (state, spans)
}

pub async fn spawn_app(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

pub fn chat_body(message: &str) -> serde_json::Value {
    serde_json::json!({ "session_id": "session-1", "message": message })
}
