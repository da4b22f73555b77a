use serde::Deserialize;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::configs::LoggingConfig;

/// Output format of the process log.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. Audit events use the `audit`
/// target, so `RUST_LOG=info,audit=off` silences them on stdout while the
/// JSONL audit log keeps recording. Calling this twice is harmless.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&config.level).unwrap_or_else(|err| {
            eprintln!(
                "invalid log level {:?} ({}); defaulting to info",
                config.level, err
            );
            EnvFilter::new("info")
        })
    });

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_timer(fmt::time::SystemTime);

    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    if result.is_ok() {
        tracing::debug!(format = ?config.format, "tracing initialised");
    }
}
