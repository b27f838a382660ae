//! Shared tracing configuration utilities for the offload workspace.
//!
//! The helpers in this crate centralise how executables and integration tests
//! install `tracing` subscribers. Routing setup through a single crate keeps
//! the logging surface consistent across the engine, the backends, and any
//! embedding binary.

use std::env;

pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Configuration describing how the shared tracing subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Optional tracing directives (e.g. `offload_core=debug,info`). When
    /// absent the crate falls back to `RUST_LOG` and finally to
    /// [`TracingConfig::default_directive`].
    pub directives: Option<String>,
    /// Fallback directive used when neither `directives` nor `RUST_LOG`
    /// resolve to a valid filter.
    pub default_directive: String,
    /// Controls whether event targets (module paths) appear in output.
    pub include_targets: bool,
    /// Controls ANSI formatting. Disable for CI logs that strip colour codes.
    pub ansi: bool,
    /// Span lifecycle events to emit. Defaults to [`FmtSpan::NONE`].
    pub span_events: FmtSpan,
    /// Output format for the formatter layer.
    pub output: TracingOutput,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Returns a configuration tuned for local development (pretty, ANSI-enabled output).
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
        }
    }

    /// Returns a configuration tuned for CI or log collection environments (JSON, no ANSI).
    pub fn for_ci() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Json,
        }
    }

    /// Build a configuration using environment hints.
    ///
    /// # Environment Variables
    ///
    /// - `OFFLOAD_TRACING_PROFILE` - Profile preset: `local` (default) or `ci`
    /// - `OFFLOAD_TRACING_DIRECTIVES` - Overrides tracing directives
    /// - `OFFLOAD_TRACING_FORMAT` - Output format: `pretty`, `compact`, or `json`
    pub fn from_env() -> Self {
        let profile = env::var("OFFLOAD_TRACING_PROFILE")
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var("OFFLOAD_TRACING_DIRECTIVES") {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var("OFFLOAD_TRACING_FORMAT") {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if matches!(config.output, TracingOutput::Json) {
                    config.ansi = false;
                }
            }
        }

        config
    }

    /// Resolve the `EnvFilter` to use for the subscriber.
    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        if let Some(directives) = &self.directives {
            EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
        } else {
            match EnvFilter::try_from_default_env() {
                Ok(filter) => Ok(filter),
                Err(_) => Ok(EnvFilter::new(self.default_directive.clone())),
            }
        }
    }
}

/// Errors surfaced when configuring the shared tracing subscriber fails.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    /// The provided directive string could not be parsed.
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),
    /// Installing the global subscriber failed (usually because one is
    /// already set).
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build a `tracing` subscriber using the provided configuration.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.resolve_filter()?;
    let span_events = config.span_events.clone();

    let layer: Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync> = match config.output {
        TracingOutput::Compact => Box::new(
            tracing_fmt::layer()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Pretty => Box::new(
            tracing_fmt::layer()
                .pretty()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Json => Box::new(
            tracing_fmt::layer()
                .json()
                .with_target(config.include_targets)
                .with_span_events(span_events)
                .with_ansi(false),
        ),
    };

    Ok(Registry::default().with(layer).with(filter))
}

/// Install the configured subscriber as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?
        .try_init()
        .map_err(TracingSetupError::SubscriberInit)
}

/// Output format choices for the tracing formatter layer.
#[derive(Clone, Debug, PartialEq, Eq)]
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to serialize environment variable tests and prevent race conditions.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn reset_env(keys: &[&str]) {
        for key in keys {
            env::remove_var(key);
        }
    }

    #[test]
    fn rejects_invalid_directive() {
        let _guard = ENV_LOCK.lock().unwrap();
        reset_env(&["OFFLOAD_TRACING_DIRECTIVES", "RUST_LOG"]);
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        let result = build_subscriber(&config);
        assert!(matches!(result, Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    fn builds_with_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        reset_env(&[]);
        let config = TracingConfig::default();
        assert!(build_subscriber(&config).is_ok());
    }

    #[test]
    fn from_env_respects_profile_and_format() {
        let _guard = ENV_LOCK.lock().unwrap();
        reset_env(&[
            "OFFLOAD_TRACING_PROFILE",
            "OFFLOAD_TRACING_FORMAT",
            "OFFLOAD_TRACING_DIRECTIVES",
        ]);

        env::set_var("OFFLOAD_TRACING_PROFILE", "ci");
        env::set_var("OFFLOAD_TRACING_FORMAT", "compact");
        env::set_var("OFFLOAD_TRACING_DIRECTIVES", "offload_core=debug");

        let config = TracingConfig::from_env();
        assert_eq!(config.directives.as_deref(), Some("offload_core=debug"));
        assert!(!config.ansi);
        assert!(matches!(config.output, TracingOutput::Compact));

        reset_env(&[
            "OFFLOAD_TRACING_PROFILE",
            "OFFLOAD_TRACING_FORMAT",
            "OFFLOAD_TRACING_DIRECTIVES",
        ]);
    }
}
