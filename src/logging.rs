//! Subscriber setup shared by the binary and the log-capturing tests.

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogConfig, LogFormat};

const QUIET_TARGETS: &str = "hyper=warn,reqwest=warn";

/// `RUST_LOG` wins; otherwise `LOG_LEVEL` with chatty HTTP crates capped at
/// warn.
pub fn env_filter(log: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(format!("{},{}", log.level, QUIET_TARGETS))
            .unwrap_or_else(|_| EnvFilter::new(format!("info,{}", QUIET_TARGETS)))
    })
}

/// JSON lines carry the innermost span's fields (`stage`, `request_id`,
/// `trace_id`) next to the event's own.
pub fn subscriber<W>(
    format: LogFormat,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Text => Box::new(
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .finish(),
        ),
        LogFormat::Json => Box::new(
            fmt()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_env_filter(filter)
                .with_writer(writer)
                .finish(),
        ),
    }
}
