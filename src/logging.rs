//! Structured logging setup.
//!
//! Logs go to stderr so the CLI's JSON output on stdout stays parseable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("docent={0},docent_lib={0},warn", default_level)));

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    };

    if result.is_ok() {
        tracing::debug!(verbose, json, "Logging initialized");
    }
}
