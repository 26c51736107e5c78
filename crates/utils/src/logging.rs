//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Maps a `-v` occurrence count to the default level filter.
pub fn level_for_verbosity(verbosity: u8) -> filter::LevelFilter {
    match verbosity {
        0 => filter::LevelFilter::WARN,
        1 => filter::LevelFilter::INFO,
        2 => filter::LevelFilter::DEBUG,
        _ => filter::LevelFilter::TRACE,
    }
}

/// initiate the global tracing subscriber
///
/// Logs always go to stderr so the wrapped command's stdout is left untouched.
/// `RUST_LOG` directives take precedence over `default_level`.
pub fn init(default_level: filter::LevelFilter) {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    registry().with(fmt_layer).init();
}
