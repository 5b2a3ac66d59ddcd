//! On-disk layout: one root directory holding the database, `settings.toml`
//! and `logs/`.
//!
//! The root is, in order: the path given to [`PathManager::set_root`]
//! (`--data-dir`), `$ENTITY_ENGINE_HOME`, or the platform data directory.

use directories::BaseDirs;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Environment variable that relocates the whole layout
pub const HOME_ENV: &str = "ENTITY_ENGINE_HOME";

const APP_DIR: &str = "entity-engine";

static ROOT_OVERRIDE: OnceLock<PathBuf> = OnceLock::new();

pub struct PathManager;

impl PathManager {
    /// Pin the root for the rest of the process; false if it was already pinned
    pub fn set_root(path: PathBuf) -> bool {
        ROOT_OVERRIDE.set(path).is_ok()
    }

    pub fn root() -> Option<PathBuf> {
        match ROOT_OVERRIDE.get() {
            Some(root) => Some(root.clone()),
            None => resolve_root(std::env::var_os(HOME_ENV)),
        }
    }

    pub fn db_path() -> Option<PathBuf> {
        Self::root().map(|root| root.join("entities.db"))
    }

    pub fn settings_path() -> Option<PathBuf> {
        Self::root().map(|root| root.join("settings.toml"))
    }

    pub fn log_file_path() -> Option<PathBuf> {
        Self::root().map(|root| root.join("logs").join("entity-engine.log"))
    }

    /// Create the root and its `logs` directory
    pub fn ensure_dirs_exist() -> std::io::Result<()> {
        match Self::root() {
            Some(root) => std::fs::create_dir_all(root.join("logs")),
            None => Ok(()),
        }
    }
}

fn resolve_root(home: Option<OsString>) -> Option<PathBuf> {
    match home.filter(|home| !home.is_empty()) {
        Some(home) => Some(PathBuf::from(home)),
        None => BaseDirs::new().map(|dirs| dirs.data_dir().join(APP_DIR)),
    }
}
