//! Process-wide tracing setup shared by the forgeflow binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat};

/// Initialize process-wide tracing with the default configuration: JSON
/// lines filtered by `RUST_LOG`, falling back to `info`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LogConfig::default());
}

/// Like [`init`], with an explicit configuration.
pub fn init_with(config: &LogConfig) {
    tracing::init(config);
}
