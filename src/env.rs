//! Environment constants and path utilities for the agent.
//!
//! Directory names, file names and environment variable names used across
//! the crate live here.

use std::path::{Path, PathBuf};

/// Per-user and per-directory configuration directory name
pub const DOCKHAND_DIR_NAME: &str = ".dockhand";

/// Configuration file name inside [`DOCKHAND_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up directly in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "dockhand.toml";

/// System-wide configuration directory
pub const SYSTEM_CONFIG_DIR: &str = "/etc/dockhand";

/// Default agent home
pub const DEFAULT_HOME: &str = "/var/lib/dockhand";

/// Event scripts directory inside the agent home
pub const EVENTS_DIR_NAME: &str = "events";

/// Executor run for delegated events
pub const EXECUTOR_FILE_NAME: &str = "executor";

/// File holding the compute host uuid
pub const UUID_FILE_NAME: &str = ".docker_uuid";

/// Environment variable overrides
pub mod vars {
    pub const HOME: &str = "DOCKHAND_HOME";
    pub const WORKERS: &str = "DOCKHAND_WORKERS";
    pub const STOP_TIMEOUT: &str = "DOCKHAND_STOP_TIMEOUT";
    pub const CONFIG_URL: &str = "DOCKHAND_CONFIG_URL";
    pub const HOSTNAME: &str = "DOCKHAND_HOSTNAME";
    pub const PHYSICAL_HOST_UUID: &str = "DOCKHAND_PHYSICAL_HOST_UUID";
    pub const DOCKER_ENABLED: &str = "DOCKER_ENABLED";
    pub const DOCKER_URL_BASE: &str = "DOCKER_URL_BASE";
    pub const DOCKER_API_VERSION: &str = "DOCKER_API_VERSION";
    pub const DOCKER_HOST_IP: &str = "DOCKER_HOST_IP";
    pub const DOCKER_UUID: &str = "DOCKER_UUID";
    pub const DOCKER_UUID_FILE: &str = "DOCKER_UUID_FILE";
    pub const DOCKER_TIMEOUT: &str = "DOCKER_TIMEOUT";
}

/// Build the events directory path from the agent home
pub fn events_dir_path(home: &Path) -> PathBuf {
    home.join(EVENTS_DIR_NAME)
}

/// Build the default executor path from the agent home
pub fn executor_path(home: &Path) -> PathBuf {
    events_dir_path(home).join(EXECUTOR_FILE_NAME)
}

/// Build the default uuid file path from the agent home
pub fn uuid_file_path(home: &Path) -> PathBuf {
    home.join(UUID_FILE_NAME)
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(DOCKHAND_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(DOCKHAND_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Build the system config file path
pub fn system_config_file_path() -> PathBuf {
    Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_paths() {
        let home = Path::new("/var/lib/dockhand");

        assert_eq!(events_dir_path(home), Path::new("/var/lib/dockhand/events"));
        assert_eq!(
            executor_path(home),
            Path::new("/var/lib/dockhand/events/executor")
        );
        assert_eq!(uuid_file_path(home), Path::new("/var/lib/dockhand/.docker_uuid"));
    }

    #[test]
    fn test_config_paths() {
        let home_dir = Path::new("/home/user");
        let current_dir = Path::new("/current/project");

        assert_eq!(
            user_config_file_path(home_dir),
            Path::new("/home/user/.dockhand/config.toml")
        );
        assert_eq!(
            local_config_file_path(current_dir),
            Path::new("/current/project/.dockhand/config.toml")
        );
        assert_eq!(
            system_config_file_path(),
            Path::new("/etc/dockhand/config.toml")
        );
    }
}
