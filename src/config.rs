//! Engine configuration
//!
//! Layered the usual way: built-in defaults, then an optional TOML file,
//! then `SEGDB_*` environment variables (e.g. `SEGDB_FREEZE_THRESHOLD_ROWS`).

use crate::error::{Error, Result};
use crate::storage::codec::CompressionAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for table directories
    pub data_dir: PathBuf,
    /// Size cache file (relative paths resolve against `data_dir`)
    pub size_cache_file: PathBuf,
    /// Compression for persisted segment files
    pub compression: CompressionAlgorithm,
    /// Live segment row count at which `maybe_freeze` converts it
    pub freeze_threshold_rows: u64,
    /// Bulk builds above this many entries sort in parallel
    pub parallel_build_threshold: usize,
    /// Period of the background size cache sync (seconds)
    pub cache_sync_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/segdb"),
            size_cache_file: PathBuf::from("size_cache.bin"),
            compression: CompressionAlgorithm::Zstd,
            freeze_threshold_rows: 100_000,
            parallel_build_threshold: 4096,
            cache_sync_interval_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&EngineConfig::default())
            .map_err(|e| Error::Config(format!("Failed to encode defaults: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(config::Environment::with_prefix("SEGDB"));

        let cfg: EngineConfig = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: EngineConfig =
            toml::from_str(s).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.freeze_threshold_rows == 0 {
            return Err(Error::Config(
                "freeze_threshold_rows must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Absolute location of the size cache file
    pub fn size_cache_path(&self) -> PathBuf {
        if self.size_cache_file.is_absolute() {
            self.size_cache_file.clone()
        } else {
            self.data_dir.join(&self.size_cache_file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.compression, CompressionAlgorithm::Zstd);
        assert_eq!(
            cfg.size_cache_path(),
            PathBuf::from("data/segdb").join("size_cache.bin")
        );
    }

    #[test]
    fn test_from_toml_partial() -> Result<()> {
        let cfg = EngineConfig::from_toml_str(
            r#"
            data_dir = "/var/lib/segdb"
            compression = "none"
            freeze_threshold_rows = 500
            "#,
        )?;
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/segdb"));
        assert_eq!(cfg.compression, CompressionAlgorithm::None);
        assert_eq!(cfg.freeze_threshold_rows, 500);
        assert_eq!(cfg.cache_sync_interval_secs, 60);
        Ok(())
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = EngineConfig::from_toml_str("freeze_threshold_rows = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("segdb_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("segdb.toml");
        std::fs::write(&path, "parallel_build_threshold = 16\n")?;

        let cfg = EngineConfig::load(Some(&path))?;
        assert_eq!(cfg.parallel_build_threshold, 16);
        assert_eq!(cfg.freeze_threshold_rows, 100_000);

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }
}
