use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};

/// The default minimum period between two eviction passes.
const DEFAULT_EVICTION_PERIOD_MIN: Duration = Duration::from_secs(30);

/// The default ratio of `size / max_size` at which eviction ignores the rate limit.
const DEFAULT_EVICTION_EMERGENCY_RATIO: f64 = 1.5;

/// The prefix of generated base directories when no explicit prefix is configured.
const DEFAULT_BASE_PATH_PREFIX: &str = "immcache";

/// Configuration of a [`DiskCache`](crate::DiskCache).
#[derive(Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Directory to store the cache in.
    ///
    /// Without a [`base_path_prefix`](Self::base_path_prefix), this directory is used directly
    /// and created if it does not exist. Otherwise, or when this is not set, a fresh directory is
    /// created inside of it (or inside the OS temporary directory).
    pub base_path: Option<PathBuf>,

    /// The prefix of a freshly created base directory.
    pub base_path_prefix: Option<String>,

    /// The key of the keyed content digest.
    ///
    /// Given as hex string in configuration files. A random secret is generated when the cache
    /// is initialized if this is not set.
    #[serde(deserialize_with = "deserialize_secret")]
    pub secret: Option<Vec<u8>>,

    /// The maximum size of all cached content, in bytes.
    ///
    /// `0` means unbounded and disables eviction entirely.
    pub max_size: u64,

    /// The minimum time between two eviction passes.
    #[serde(with = "humantime_serde")]
    pub eviction_period_min: Duration,

    /// The ratio of `size / max_size` at which an eviction pass runs regardless of
    /// [`eviction_period_min`](Self::eviction_period_min).
    ///
    /// Values below `1.0` fall back to the default of `1.5`.
    pub eviction_emergency_ratio: f64,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            base_path: None,
            base_path_prefix: None,
            secret: None,
            max_size: 0,
            eviction_period_min: DEFAULT_EVICTION_PERIOD_MIN,
            eviction_emergency_ratio: DEFAULT_EVICTION_EMERGENCY_RATIO,
        }
    }
}

impl fmt::Debug for DiskCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCacheConfig")
            .field("base_path", &self.base_path)
            .field("base_path_prefix", &self.base_path_prefix)
            .field("secret", &self.secret.as_ref().map(|_| "[redacted]"))
            .field("max_size", &self.max_size)
            .field("eviction_period_min", &self.eviction_period_min)
            .field("eviction_emergency_ratio", &self.eviction_emergency_ratio)
            .finish()
    }
}

impl DiskCacheConfig {
    /// Loads the configuration from a YAML file, or returns the default configuration.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Self::default()),
        }
    }

    /// Parses the configuration from YAML.
    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The emergency ratio, with out of range values replaced by the default.
    pub fn emergency_ratio(&self) -> f64 {
        if self.eviction_emergency_ratio < 1.0 {
            DEFAULT_EVICTION_EMERGENCY_RATIO
        } else {
            self.eviction_emergency_ratio
        }
    }

    /// Resolves and creates the base directory of the cache.
    pub(crate) fn create_base_dir(&self) -> std::io::Result<PathBuf> {
        match (&self.base_path, &self.base_path_prefix) {
            (Some(base_path), None) => {
                fs::create_dir_all(base_path)?;
                Ok(base_path.clone())
            }
            (base_path, prefix) => {
                let parent = base_path.clone().unwrap_or_else(std::env::temp_dir);
                let prefix = prefix.as_deref().unwrap_or(DEFAULT_BASE_PATH_PREFIX);
                let name = format!("{prefix}{}", hex::encode(rand::random::<[u8; 6]>()));
                let dir = parent.join(name);
                fs::create_dir(&dir)?;
                Ok(dir)
            }
        }
    }
}

fn deserialize_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<u8>>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        Some(secret) => hex::decode(secret.trim())
            .map(Some)
            .map_err(|e| de::Error::custom(format_args!("invalid hex secret: {e}"))),
        None => Ok(None),
    }
}
