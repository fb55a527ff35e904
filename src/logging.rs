use crate::redaction::RedactingWriter;
use colored::*;
use std::panic;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

pub const DEFAULT_LOG_FILTER: &str = "parley=info";

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub directory: String,
    pub file_name: String,
    pub json_stderr: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            directory: ".".to_string(),
            file_name: "parley.log".to_string(),
            json_stderr: false,
        }
    }
}

/// Installs the global subscriber. Keep the guard alive until exit so the
/// file writer flushes.
pub fn init_tracing(options: &LogOptions) -> WorkerGuard {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    let file_appender = tracing_appender::rolling::daily(&options.directory, &options.file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = options.json_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(move || RedactingWriter::new(non_blocking.clone()))
                .with_ansi(false),
        )
        .with(stderr_layer)
        .with(tracing_error::ErrorLayer::default());

    if let Err(e) = registry.try_init() {
        eprintln!("{} {}", "Logging already initialised:".yellow(), e);
    }
    guard
}

/// Routes panics through tracing before the default hook prints them.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-stream counters, logged once when the stream ends.
#[derive(Debug, Default)]
pub struct StreamMetric {
    pub chunks: usize,
    pub events: usize,
    pub text_chars: usize,
    started: Option<std::time::Instant>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self {
            started: Some(std::time::Instant::now()),
            ..Self::default()
        }
    }

    pub fn record_chunk(&mut self, events: usize) {
        self.chunks += 1;
        self.events += events;
    }

    pub fn record_text(&mut self, text: &str) {
        self.text_chars += text.chars().count();
    }

    pub fn log_summary(&self) {
        let elapsed_ms = self
            .started
            .map(|s| s.elapsed().as_millis())
            .unwrap_or_default();
        info!(
            "[STREAM END] Chunks: {} | Events: {} | Text: {} chars | {} ms",
            self.chunks, self.events, self.text_chars, elapsed_ms
        );
    }
}
