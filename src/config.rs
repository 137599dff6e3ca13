//! Store configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration for the storage engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Core store tunables.
    #[serde(default)]
    pub store: StoreConfig,

    /// Swap (disk) directories. May be empty, which disables swap-out.
    #[serde(default)]
    pub swap_dirs: Vec<SwapDirConfig>,

    /// Memory cache tier configuration.
    #[serde(default)]
    pub mem_cache: MemCacheConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// The per-store maximum object size: the largest of the configured
    /// per-directory limits, in effect only when every directory has one.
    pub fn max_object_size(&self) -> Option<u64> {
        if self.swap_dirs.is_empty() {
            return None;
        }
        self.swap_dirs
            .iter()
            .map(|d| d.max_object_size)
            .collect::<Option<Vec<_>>>()
            .map(|sizes| sizes.into_iter().max().unwrap())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            swap_dirs: Vec::new(),
            mem_cache: MemCacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Core store tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Page size in bytes: the unit of buffering and of swap-out writes.
    #[serde(default = "StoreConfig::default_page_size")]
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: Self::default_page_size(),
        }
    }
}

impl StoreConfig {
    fn default_page_size() -> usize {
        crate::page::PAGE_SIZE
    }
}

/// One swap directory.
#[derive(Debug, Clone, Deserialize)]
pub struct SwapDirConfig {
    /// Directory root for object files and the swap log.
    pub path: PathBuf,

    /// Number of file slots in this directory.
    #[serde(default = "SwapDirConfig::default_slots")]
    pub slots: u32,

    /// Largest object this directory will accept, in bytes.
    pub max_object_size: Option<u64>,

    /// Replay the swap log on startup to rebuild the disk index.
    #[serde(default = "SwapDirConfig::default_recover_on_startup")]
    pub recover_on_startup: bool,
}

impl SwapDirConfig {
    /// Config for a directory rooted at `path`, with defaults elsewhere.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            slots: Self::default_slots(),
            max_object_size: None,
            recover_on_startup: Self::default_recover_on_startup(),
        }
    }

    fn default_slots() -> u32 {
        1 << 16
    }

    fn default_recover_on_startup() -> bool {
        true
    }
}

/// Memory cache tier configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MemCacheConfig {
    /// Enable the in-memory object cache.
    #[serde(default = "MemCacheConfig::default_enabled")]
    pub enabled: bool,

    /// Total bytes of object data the tier may hold.
    #[serde(default = "MemCacheConfig::default_capacity")]
    pub capacity: u64,

    /// Maximum number of objects the tier may hold.
    #[serde(default = "MemCacheConfig::default_max_entries")]
    pub max_entries: usize,

    /// Largest single object the tier will keep, in bytes.
    #[serde(default = "MemCacheConfig::default_max_object_size")]
    pub max_object_size: u64,
}

impl Default for MemCacheConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            capacity: Self::default_capacity(),
            max_entries: Self::default_max_entries(),
            max_object_size: Self::default_max_object_size(),
        }
    }
}

impl MemCacheConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_capacity() -> u64 {
        64 * 1024 * 1024 // 64MB
    }

    fn default_max_entries() -> usize {
        1 << 14
    }

    fn default_max_object_size() -> u64 {
        512 * 1024 // 512KB
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Log format: "pretty", "json", or "compact".
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_format() -> String {
        "pretty".to_string()
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(std::io::Error),
    /// The file is not valid TOML or does not match the schema.
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
