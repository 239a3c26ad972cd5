use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{LogFormat, LoggingConfig};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the process-wide subscriber. Diagnostics go to stderr so the
/// CLI's JSON output on stdout stays clean.
pub fn init(logging: Option<&LoggingConfig>, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let log_level = resolve_log_level(logging, cli_level_override)?;

    match resolve_log_format(logging) {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .with_writer(std::io::stderr)
            .pretty()
            .try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(())
}

fn resolve_log_level(
    logging: Option<&LoggingConfig>,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = cli_level_override
        .or_else(|| logging.and_then(|logging| logging.level.as_deref()))
        .unwrap_or(DEFAULT_LOG_LEVEL);
    let normalized = raw_level.trim().to_ascii_lowercase();

    normalized.parse::<LevelFilter>().map_err(|_| {
        anyhow!(
            "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
        )
    })
}

fn resolve_log_format(logging: Option<&LoggingConfig>) -> LogFormat {
    logging
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}
