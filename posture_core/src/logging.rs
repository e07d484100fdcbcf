//! Tracing setup for the posture monitor.
//!
//! Logs always go to stderr so command output on stdout stays parseable.
//! `RUST_LOG` wins over the level picked from the command line.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter level for a `-v`/`-q` combination
///
/// Quiet keeps errors only. Each `-v` step goes one level deeper, and at
/// trace the per-sample controller noise is included.
pub fn level_for_verbosity(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

pub fn init() {
    init_with_level("info")
}

/// Install the stderr subscriber. A second call keeps the first subscriber.
pub fn init_with_level(default_level: &str) {
    let installed = tracing_subscriber::registry()
        .with(filter(default_level))
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();
    if installed.is_err() {
        tracing::debug!("Logging already initialised, keeping existing subscriber");
    }
}

#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("debug"))
        .try_init();
}
