use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::merge::{apply_env_overrides, merge_layers};
use super::{Config, ConfigLayer, ServerRole};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("configured role is {configured:?}, cannot start as {requested:?}")]
    Role {
        configured: ServerRole,
        requested: ServerRole,
    },
}

/// Reads one layer. A missing file is not an error.
pub fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Defaults, then each existing file in order, then the environment.
pub fn load(paths: &[&Path]) -> Result<Config, ConfigError> {
    let mut layers = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(layer) = load_layer(path)? {
            tracing::debug!(path = %path.display(), "loaded config layer");
            layers.push(layer);
        }
    }
    let mut config = merge_layers(layers);
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(write_err)?;
    let contents = toml::to_string_pretty(cfg)?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    fs::write(temp.path(), contents.as_bytes()).map_err(write_err)?;
    temp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}
