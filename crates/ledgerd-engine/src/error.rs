//! Error types for the daemon binary.

/// Top-level error for the daemon binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ledgerd_core::ConfigError,
    },

    /// The daemon failed to open, start, or shut down cleanly.
    #[error("daemon error: {source}")]
    Daemon {
        /// The underlying daemon error.
        #[from]
        source: ledgerd_core::DaemonError,
    },
}
