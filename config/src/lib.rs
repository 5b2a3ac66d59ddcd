pub mod paths;
pub mod settings;

pub use paths::PathManager;
pub use settings::{AiSettings, EngineSettings, ProviderKind, ProviderSettings, ServerSettings};

/// Load environment variables from .env files.
/// First loads from ~/.env (home directory), then from ./.env (project directory).
/// Project directory values take precedence over home directory values.
/// Call this before parsing CLI args so `env` defaults are visible to clap.
pub fn load_env_file() {
    if let Some(dirs) = directories::UserDirs::new() {
        dotenv::from_path(dirs.home_dir().join(".env")).ok();
    }

    dotenv::dotenv().ok();
}
