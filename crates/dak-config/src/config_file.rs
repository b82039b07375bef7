use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_FILE: &str = ".dak-watch.toml";

/// Error reading or parsing a config file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load config file content from CWD first, then the config directory
///
/// Searches for:
/// 1. `.dak-watch.toml` in the current working directory
/// 2. `config.toml` in the platform config directory
///
/// Returns the path and content of the first file found.
pub fn load_config_file() -> Option<(PathBuf, String)> {
    let candidates = std::iter::once(PathBuf::from(CONFIG_FILE))
        .chain(crate::paths::app_config_path().ok());

    for path in candidates {
        if let Ok(content) = read(&path) {
            log::debug!("Loaded config from {}", path.display());
            return Some((path, content));
        }
    }

    None
}

/// Read a config file, keeping the path in the error
pub fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}
