//! Logging setup for the inkwell binary
//!
//! Log lines go to stderr so that `--json` command output on stdout stays
//! parseable. Inkwell's own crates log at the configured level and all
//! dependencies at `warn`; `RUST_LOG` replaces both when set.

use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Targets that follow the configured level
const STUDIO_TARGETS: [&str; 2] = ["inkwell_engine", "inkwell"];

/// Level used when the requested one does not parse
const FALLBACK_LEVEL: &str = "info";

/// Shape of emitted log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact single-line records for a terminal
    Human,
    /// One JSON object per record, with the enclosing span's fields
    Json,
}

impl LogFormat {
    /// Logs follow the command output format.
    pub fn for_output(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Human
        }
    }
}

/// Filter directives with the studio targets at `level`.
pub fn directives(level: &str) -> String {
    let mut parts = vec!["warn".to_string()];
    parts.extend(STUDIO_TARGETS.iter().map(|target| format!("{}={}", target, level)));
    parts.join(",")
}

pub fn build_filter(level: &str) -> Result<EnvFilter, ParseError> {
    EnvFilter::try_new(directives(level))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_telemetry(level: &str, format: LogFormat) {
    let mut rejected = None;
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(level).unwrap_or_else(|e| {
            rejected = Some(e);
            EnvFilter::new(directives(FALLBACK_LEVEL))
        }),
    };

    let subscriber = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Human => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    if let (Ok(()), Some(e)) = (installed, rejected) {
        tracing::warn!(level, error = %e, "Unknown log level, using {}", FALLBACK_LEVEL);
    }
}
