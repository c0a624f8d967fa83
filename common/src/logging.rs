use crate::config::LoggingConfig;

/// Install the global `tracing` subscriber, writing to stderr. `RUST_LOG`
/// wins over the configured level.
pub fn init(config: &LoggingConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.level.parse().unwrap_or_default()),
        )
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();
}
