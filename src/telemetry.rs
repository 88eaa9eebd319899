//! Ambient logging bootstrap. Distinct from the product's own `Event`
//! stream (`crate::event`): this is operational `tracing` output to
//! stderr, not the user-facing SSE feed.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber. Safe to call once at
/// process start; a second call is a no-op (errors are swallowed since
/// tests may initialize more than once across the same process).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}
