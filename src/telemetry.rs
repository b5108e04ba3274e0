//! Tracing subscriber setup for binaries and tests.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the embedding program.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor the caller sets one.
pub const DEFAULT_FILTER: &str = "package_harvester=info";

/// Installs a global `fmt` subscriber. `RUST_LOG` overrides
/// `default_filter` when set.
///
/// Returns `false` if a global subscriber was already installed, so it is
/// safe to call from every test.
pub fn init(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
