//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

/// Install a stderr fmt subscriber filtered by `RUST_LOG` (default `default_level`).
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_with(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn init() {
    init_with("info");
}
