//! Logging configuration and initialization.

use crate::app::config::AppConfig;
use tracing::{debug, trace};

/// Initialize `tracing` for the process. Verbosity scales both the filter
/// and the fields shown: `-vv` adds the emitting module, `-vvv` adds
/// thread ids and line numbers.
pub fn init_logging(config: &AppConfig) {
    let log_level = config.log_level();

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(config.verbose >= 2)
        .with_thread_ids(config.verbose >= 3)
        .with_line_number(config.verbose >= 3)
        .init();

    debug!("orchestra-core started with verbosity level: {}", config.verbose);
    trace!("full CLI args: {:?}", std::env::args().collect::<Vec<_>>());
}
