// SPDX-License-Identifier: MIT OR Apache-2.0
//! Engine configuration
//!
//! Settings live in a RON file. The file is looked up in this order:
//! 1. A path given on the command line
//! 2. The `VIZFLOW_CONFIG` environment variable
//! 3. `vizflow.ron` in the working directory
//!
//! When none is found the defaults apply. A file that exists but does not
//! parse is an error.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use vizflow_graph::RevisitPolicy;

/// Current config format version
pub const CONFIG_FORMAT_VERSION: u32 = 1;

/// Config file looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "vizflow.ron";

/// Environment variable naming a config file
pub const CONFIG_ENV_VAR: &str = "VIZFLOW_CONFIG";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading or writing the file failed
    #[error("Failed to access config {path}: {source}")]
    Io {
        /// Config file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid RON for [`EngineConfig`]
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// The config could not be written as RON
    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    /// The file was written by a newer version
    #[error("Config version {found} is newer than supported version {supported}")]
    UnsupportedVersion {
        /// Version in the file
        found: u32,
        /// Newest version understood here
        supported: u32,
    },
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Config format version
    pub version: u32,
    /// Worker pool size; 0 runs background work on the calling thread
    pub worker_threads: usize,
    /// Whether events reach a node again through a second branch
    pub event_revisit: RevisitPolicy,
    /// Global picking switch
    pub picking_enabled: bool,
    /// Log filter used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Frames the demo network runs
    pub frames: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_FORMAT_VERSION,
            worker_threads: 2,
            event_revisit: RevisitPolicy::Deduplicate,
            picking_enabled: true,
            log_filter: "info".to_string(),
            frames: 3,
        }
    }
}

impl EngineConfig {
    /// Parse from RON, rejecting newer format versions
    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            ron::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        if config.version > CONFIG_FORMAT_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: config.version,
                supported: CONFIG_FORMAT_VERSION,
            });
        }

        Ok(config)
    }

    /// Serialize to pretty RON
    pub fn to_ron(&self) -> Result<String, ConfigError> {
        let config = ron::ser::PrettyConfig::default()
            .struct_names(true)
            .enumerate_arrays(false);
        ron::ser::to_string_pretty(self, config).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&content)
    }

    /// Save to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_ron()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path`, or fall back to the defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Resolve the config from the command line, environment and working
    /// directory. Returns the config and the file it came from, if any.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let cwd = std::env::current_dir().unwrap_or_default();
        let Some(path) = locate(explicit, std::env::var_os(CONFIG_ENV_VAR), &cwd) else {
            return Ok((Self::default(), None));
        };
        let config = Self::load_or_default(&path)?;
        let found = path.exists();
        Ok((config, found.then_some(path)))
    }
}

/// Pick the config file to use. Explicit choices win even when the file is
/// missing; the working directory file is only used if it exists.
fn locate(explicit: Option<&Path>, env: Option<OsString>, cwd: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    let local = cwd.join(CONFIG_FILE_NAME);
    local.exists().then_some(local)
}
