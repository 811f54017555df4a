//! Log output for the command-line tool.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a stderr subscriber. `RUST_LOG` wins over the configured level.
pub fn init(level: &str, verbose: bool) {
    let default_directive = if verbose {
        "debug".to_string()
    } else {
        format!("warn,verity_auth={level},verity_storage={level},verity={level}")
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .without_time();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
