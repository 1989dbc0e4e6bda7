// segdb - Segmented table storage engine
// Row stores and ordered indexes composed into frozen/live segment chains

#![warn(rust_2018_idioms)]

pub mod config;
pub mod storage;

// Re-exports for convenience
pub use config::EngineConfig;
pub use storage::{
    CompositeTable, DbContext, ReadableIndex, ReadableStore, SizeCache, WritableIndex,
    WritableStore,
};

/// segdb error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Duplicate key: {0}")]
        DuplicateKey(String),

        #[error("Corrupt data: {0}")]
        Corrupt(String),

        #[error("Invalid state: {0}")]
        InvalidState(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
    }

    impl Error {
        /// Recoverable errors are reported to the caller; the rest indicate
        /// damaged data or a programming mistake.
        pub fn is_recoverable(&self) -> bool {
            matches!(self, Error::NotFound(_) | Error::DuplicateKey(_))
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        let _version: &str = VERSION;
    }

    #[test]
    fn test_error_recoverability() {
        use error::Error;

        assert!(Error::NotFound("row 3".into()).is_recoverable());
        assert!(Error::DuplicateKey("k".into()).is_recoverable());
        assert!(!Error::Corrupt("bad frame".into()).is_recoverable());
        assert!(!Error::InvalidState("frozen".into()).is_recoverable());
    }
}
