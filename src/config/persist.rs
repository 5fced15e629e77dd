//! Saved planet configuration and pid files

use std::path::{Path, PathBuf};

use super::document::PlanetDocument;
use super::ConfigError;

/// Location of a manager's saved planet configuration
pub fn planet_path(config_dir: &Path, manager_name: &str) -> PathBuf {
    config_dir
        .join("managers")
        .join(manager_name)
        .join("planet.toml")
}

/// Write `document` under `config_dir`, creating directories as needed
pub fn save_planet(
    config_dir: &Path,
    manager_name: &str,
    document: &PlanetDocument,
) -> Result<PathBuf, ConfigError> {
    let path = planet_path(config_dir, manager_name);
    let text = document.to_toml_string()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileWrite {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    // Write then rename so readers never see a partial file
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, text).map_err(|source| ConfigError::FileWrite {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, &path).map_err(|source| ConfigError::FileWrite {
        path: path.clone(),
        source,
    })?;

    tracing::info!(manager = manager_name, path = %path.display(), "Saved planet configuration");
    Ok(path)
}

/// Load a previously saved planet, if there is one
pub fn load_planet(
    config_dir: &Path,
    manager_name: &str,
) -> Result<Option<PlanetDocument>, ConfigError> {
    let path = planet_path(config_dir, manager_name);
    if !path.exists() {
        return Ok(None);
    }
    PlanetDocument::load(&path).map(Some)
}

/// Location of the pid file for a process of `kind` named `name`
pub fn pid_path(run_dir: &Path, kind: &str, name: &str) -> PathBuf {
    run_dir.join(format!("{}.{}.pid", kind, name))
}

/// Record the current process id
pub fn write_pid_file(run_dir: &Path, kind: &str, name: &str) -> Result<PathBuf, ConfigError> {
    let path = pid_path(run_dir, kind, name);
    std::fs::create_dir_all(run_dir).map_err(|source| ConfigError::FileWrite {
        path: run_dir.to_path_buf(),
        source,
    })?;
    std::fs::write(&path, format!("{}\n", std::process::id())).map_err(|source| {
        ConfigError::FileWrite {
            path: path.clone(),
            source,
        }
    })?;
    Ok(path)
}

/// Read the pid recorded for `kind`/`name`
pub fn read_pid_file(run_dir: &Path, kind: &str, name: &str) -> Result<Option<u32>, ConfigError> {
    let path = pid_path(run_dir, kind, name);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ConfigError::FileRead { path, source }),
    };
    text.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Parse {
            path: Some(path),
            message: format!("not a pid: {:?}", text.trim()),
        })
}

/// Remove the pid file; a missing file is not an error
pub fn delete_pid_file(run_dir: &Path, kind: &str, name: &str) -> Result<(), ConfigError> {
    let path = pid_path(run_dir, kind, name);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ConfigError::FileWrite { path, source }),
    }
}
