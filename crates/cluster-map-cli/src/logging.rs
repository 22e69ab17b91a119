use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Initialize logging to stderr
///
/// If RUST_LOG is not set, the default is `debug` for debug builds and `info` otherwise.
pub fn setup_logging() {
    let default_directive = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);
    tracing_subscriber::registry().with(fmt_layer).init();
}
