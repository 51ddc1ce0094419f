//! Logging setup for `cfut`
//!
//! The filter is taken from `CFUT_LOG` (e.g. `debug` or `cluster_futures::wait=trace`),
//! otherwise everything at `info` and above is shown, `debug` with the debug flag. Logs go to
//! stderr so stdout stays free for task output.

use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "CFUT_LOG";

/// Install the global subscriber, does nothing if one is installed already
pub fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init();
}
