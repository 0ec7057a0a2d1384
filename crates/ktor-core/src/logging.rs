//! Logging init: stderr subscriber with env-filter control.
//!
//! Progress lines go to stdout, so all diagnostics are kept on stderr.
//! `RUST_LOG` overrides the level chosen here.

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber writing to stderr.
/// With `verbose`, core and CLI debug output is enabled (circuit bootstrap
/// lines, per-chunk dispatch, retry attempts).
pub fn init(verbose: bool) {
    let default_filter = if verbose {
        "info,ktor_core=debug,ktor=debug"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
