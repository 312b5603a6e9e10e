use anyhow::Result;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub fn init_logger() -> Result<()> {
    // Get log level from environment (default: info)
    let log_level =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,memory_proxy=debug".to_string());

    // Get log format from environment (default: pretty)
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let filter = EnvFilter::try_new(&log_level)?;

    // Optional file output (LOG_DIR/memory-proxy.<date>.log, daily rotation)
    let file_layer = match std::env::var("LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("memory-proxy")
                .filename_suffix("log")
                .build(dir)?;

            Some(
                fmt::layer()
                    .json()
                    .with_writer(file_appender)
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(false),
            )
        }
        _ => None,
    };

    let stdout_layer = match log_format.as_str() {
        // Machine-readable output for log shippers
        "json" => fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(true)
            .boxed(),
        _ => fmt::layer()
            .pretty()
            .with_writer(std::io::stdout)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}
