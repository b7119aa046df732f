//! Configuration for the evidence cache.
//!
//! The engine's entire external configuration surface: the cache root
//! directory and the maximum total cache size. Values can be set
//! programmatically or loaded from environment variables.

use std::path::{Path, PathBuf};

/// Default cache size limit (500 MB).
pub const DEFAULT_CACHE_SIZE_LIMIT_MB: u64 = 500;

/// Configuration for the evidence rendering cache.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceConfig {
    /// Root directory for cached images. Renders and crops live in
    /// `renders/` and `crops/` subdirectories of this path.
    pub cache_dir: PathBuf,
    /// Maximum total cache size in bytes across both tiers. A soft
    /// target: a single pending write may momentarily overshoot it.
    pub max_cache_bytes: u64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            cache_dir: Self::default_cache_dir(),
            max_cache_bytes: DEFAULT_CACHE_SIZE_LIMIT_MB * 1024 * 1024,
        }
    }
}

impl EvidenceConfig {
    /// Creates a configuration with the given cache directory and size
    /// limit in megabytes.
    pub fn new<P: AsRef<Path>>(cache_dir: P, max_size_mb: u64) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            max_cache_bytes: max_size_mb * 1024 * 1024,
        }
    }

    /// Sets the cache directory.
    pub fn with_cache_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.cache_dir = path.as_ref().to_path_buf();
        self
    }

    /// Sets the maximum cache size in megabytes.
    pub fn with_max_size_mb(mut self, mb: u64) -> Self {
        self.max_cache_bytes = mb * 1024 * 1024;
        self
    }

    /// Returns the maximum cache size in megabytes.
    pub fn max_size_mb(&self) -> u64 {
        self.max_cache_bytes / (1024 * 1024)
    }

    /// Subdirectory holding full-page renders.
    pub fn renders_dir(&self) -> PathBuf {
        self.cache_dir.join("renders")
    }

    /// Subdirectory holding crops.
    pub fn crops_dir(&self) -> PathBuf {
        self.cache_dir.join("crops")
    }

    /// Returns the default cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/drawchat/evidence
    /// - Linux: ~/.cache/drawchat/evidence
    /// - Windows: %LOCALAPPDATA%\drawchat\evidence
    pub fn default_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("drawchat").join("evidence")
        } else {
            // Fallback to a relative path if no platform cache dir exists
            PathBuf::from("cache/evidence")
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// - `DRAWCHAT_EVIDENCE_CACHE_MB`: maximum cache size in MB (default: 500)
    /// - `DRAWCHAT_EVIDENCE_CACHE_DIR`: cache directory path
    ///
    /// # Errors
    /// Returns an error if a variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DRAWCHAT_EVIDENCE_CACHE_MB") {
            let mb = val
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue("DRAWCHAT_EVIDENCE_CACHE_MB".to_string()))?;
            config.max_cache_bytes = mb * 1024 * 1024;
        }

        if let Ok(val) = std::env::var("DRAWCHAT_EVIDENCE_CACHE_DIR") {
            if val.is_empty() {
                return Err(ConfigError::InvalidValue("DRAWCHAT_EVIDENCE_CACHE_DIR".to_string()));
            }
            config.cache_dir = PathBuf::from(val);
        }

        Ok(config)
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
