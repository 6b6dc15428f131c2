use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging with environment filter.
/// Set VKSPAN_LOG=debug (or trace, info, warn, error) for verbosity control;
/// `default_filter` applies when the variable is unset.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_env("VKSPAN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    // The layer is loaded into arbitrary host processes which may have their
    // own subscriber; a second init must not panic.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
