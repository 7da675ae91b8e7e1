//! Tracing subscriber setup for the daemon and tests.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. The `CONFAB_LOG` environment variable
/// takes precedence over the verbosity flag; calling twice is harmless.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("CONFAB_LOG")
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn level_from_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}
