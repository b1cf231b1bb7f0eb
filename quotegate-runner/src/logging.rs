//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset, by verbosity (`-v` count).
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "quotegate=info,quotegate_core=info,quotegate_runner=info",
        1 => "quotegate=debug,quotegate_core=debug,quotegate_runner=debug",
        _ => "trace",
    }
}

/// Install the global fmt subscriber, writing to stderr.
///
/// `RUST_LOG` wins over `verbosity`. Calling this twice is harmless; the
/// second install is ignored.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
