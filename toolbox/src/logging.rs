//! Operator-facing progress output.
//!
//! Every check, decision and action of a pass is emitted as a `tracing` event so
//! an operator tailing the launch agent's log can reconstruct why something was
//! (or was not) restarted. There is no separate structured log.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` so progress lines are visible.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=toolbox=debug toolbox code_changed
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
