//! Shared tracing configuration for the lumen workspace.
//!
//! Binaries, benches and integration tests install their `tracing` subscriber
//! through this crate so that filter resolution and output formats stay
//! consistent across the workspace.

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;

pub use tracing;
pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// How the shared subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives such as `lumen_core=debug,info`. Falls back to
    /// `RUST_LOG`, then to [`TracingConfig::default_directive`].
    pub directives: Option<String>,
    pub default_directive: String,
    /// Show event targets (module paths).
    pub include_targets: bool,
    pub ansi: bool,
    pub span_events: FmtSpan,
    pub output: TracingOutput,
    /// Emit `perf` spans. When false callers may skip building them.
    pub enable_performance_tracing: bool,
    /// Minimum duration for performance spans to be logged.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Pretty, colored output for local development.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            enable_performance_tracing: cfg!(debug_assertions),
            performance_threshold_us: None,
        }
    }

    /// JSON without ANSI codes, for log collection.
    pub fn for_ci() -> Self {
        Self {
            ansi: false,
            output: TracingOutput::Json,
            enable_performance_tracing: false,
            ..Self::for_local()
        }
    }

    /// Debug-level scheduler and engine logs with span close events.
    pub fn for_profiling() -> Self {
        Self {
            directives: Some("lumen_backends=debug,lumen_core=debug".to_string()),
            ansi: false,
            span_events: FmtSpan::CLOSE,
            output: TracingOutput::Json,
            enable_performance_tracing: true,
            ..Self::for_local()
        }
    }

    /// Build a configuration from environment hints.
    ///
    /// - `LUMEN_TRACING_PROFILE`: `local` (default), `ci` or `profiling`
    /// - `LUMEN_TRACING_DIRECTIVES`: filter directives
    /// - `LUMEN_TRACING_FORMAT`: `pretty`, `compact` or `json`
    /// - `LUMEN_PERF_TRACING`: `true`/`1`/`yes` to enable performance spans
    /// - `LUMEN_PERF_THRESHOLD_US`: minimum logged span duration
    pub fn from_env() -> Self {
        let profile = env::var("LUMEN_TRACING_PROFILE")
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            "profiling" => Self::for_profiling(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var("LUMEN_TRACING_DIRECTIVES") {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var("LUMEN_TRACING_FORMAT") {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if config.output == TracingOutput::Json {
                    config.ansi = false;
                }
            }
        }

        if let Ok(flag) = env::var("LUMEN_PERF_TRACING") {
            config.enable_performance_tracing =
                flag.eq_ignore_ascii_case("true") || flag == "1" || flag.eq_ignore_ascii_case("yes");
        }

        if let Ok(threshold) = env::var("LUMEN_PERF_THRESHOLD_US") {
            if let Ok(threshold_us) = threshold.trim().parse::<u64>() {
                config.performance_threshold_us = Some(threshold_us);
            }
        }

        config
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

/// Formatter layer output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Failures while installing the shared subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),

    /// Usually means a global subscriber is already installed.
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build a subscriber for `config` without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.resolve_filter()?;
    Ok(Registry::default().with(format_layer(config)).with(filter))
}

fn format_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_span_events(config.span_events.clone());

    match config.output {
        TracingOutput::Compact => Box::new(layer.compact().with_ansi(config.ansi)),
        TracingOutput::Pretty => Box::new(layer.pretty().with_ansi(config.ansi)),
        TracingOutput::Json => Box::new(layer.json().with_ansi(false)),
    }
}

/// Install the configured subscriber as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?.try_init()?;
    Ok(())
}

/// Install a compact subscriber for tests. Repeated calls are ignored.
pub fn init_test_tracing() {
    let config = TracingConfig {
        output: TracingOutput::Compact,
        ansi: false,
        default_directive: "warn".to_string(),
        ..TracingConfig::for_local()
    };
    if let Ok(subscriber) = build_subscriber(&config) {
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 6] = [
        "LUMEN_TRACING_PROFILE",
        "LUMEN_TRACING_DIRECTIVES",
        "LUMEN_TRACING_FORMAT",
        "LUMEN_PERF_TRACING",
        "LUMEN_PERF_THRESHOLD_US",
        "RUST_LOG",
    ];

    fn reset_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn rejects_invalid_directive() {
        reset_env();
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        assert!(matches!(build_subscriber(&config), Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    #[serial]
    fn builds_every_output_format() {
        reset_env();
        for output in [TracingOutput::Compact, TracingOutput::Pretty, TracingOutput::Json] {
            let config = TracingConfig {
                output,
                ..TracingConfig::default()
            };
            assert!(build_subscriber(&config).is_ok());
        }
    }

    #[test]
    #[serial]
    fn from_env_applies_profile_and_overrides() {
        reset_env();
        env::set_var("LUMEN_TRACING_PROFILE", "ci");
        env::set_var("LUMEN_TRACING_FORMAT", "compact");
        env::set_var("LUMEN_TRACING_DIRECTIVES", "lumen_core=trace");
        env::set_var("LUMEN_PERF_TRACING", "yes");
        env::set_var("LUMEN_PERF_THRESHOLD_US", "250");

        let config = TracingConfig::from_env();
        assert_eq!(config.directives.as_deref(), Some("lumen_core=trace"));
        assert_eq!(config.output, TracingOutput::Compact);
        assert!(!config.ansi);
        assert!(config.enable_performance_tracing);
        assert_eq!(config.performance_threshold_us, Some(250));
        reset_env();
    }

    #[test]
    #[serial]
    fn unknown_format_keeps_profile_default() {
        reset_env();
        env::set_var("LUMEN_TRACING_PROFILE", "profiling");
        env::set_var("LUMEN_TRACING_FORMAT", "xml");

        let config = TracingConfig::from_env();
        assert_eq!(config.output, TracingOutput::Json);
        assert!(config.enable_performance_tracing);
        reset_env();
    }
}
