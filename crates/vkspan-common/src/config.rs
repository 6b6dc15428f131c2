use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Layer configuration, loaded from the TOML file named by VKSPAN_CONFIG.
/// Every field has a default; with no file present the defaults apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VkspanConfig {
    /// Where to stream trace events (JSON lines). None disables the writer.
    pub output_path: Option<PathBuf>,
    /// Size of the first timestamp query pool per device.
    #[serde(default = "default_initial_slots")]
    pub initial_slots: u32,
    /// Upper bound on timestamp query slots per device across all pools.
    #[serde(default = "default_max_slots")]
    pub max_slots: u32,
    /// Log filter used when VKSPAN_LOG is unset.
    #[serde(default = "default_log")]
    pub log: String,
}

fn default_initial_slots() -> u32 {
    64
}

fn default_max_slots() -> u32 {
    16384
}

fn default_log() -> String {
    "info".to_string()
}

impl Default for VkspanConfig {
    fn default() -> Self {
        Self {
            output_path: None,
            initial_slots: default_initial_slots(),
            max_slots: default_max_slots(),
            log: default_log(),
        }
    }
}

impl VkspanConfig {
    /// Load from the path in VKSPAN_CONFIG, falling back to defaults when the
    /// variable is unset. A present-but-broken file is an error; a silent
    /// fallback there would hide misconfiguration.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var("VKSPAN_CONFIG") {
            Ok(path) => Self::load_from(&path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}
