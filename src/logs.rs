//! Tracing initialisation.
//!
//! Layered-subscriber setup (env filter + fmt layer); no log-broadcast
//! layer since this bridge has no `/ws/logs` consumer for it.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global tracing subscriber. Respects `RUST_LOG`, falling
/// back to `info`.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}
