//! Platform-specific paths for the local secret store and client configuration

use std::path::PathBuf;

const APP_DIR: &str = "Twofold";

/// Get the platform-specific data directory for storing application data
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\Twofold
/// - macOS: ~/Library/Application Support/Twofold
/// - Linux/Other: ~/.local/share/Twofold
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Get the platform-specific config directory
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Get the default secret store database path
pub fn get_default_store_path() -> PathBuf {
    get_data_dir().join("secrets.db")
}

/// Get the default client configuration file path
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("twofold.toml")
}

/// Create the data directory if it does not exist yet
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let dir = get_data_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_end_with_app_dir() {
        assert!(get_data_dir().ends_with(APP_DIR));
        assert!(get_config_dir().ends_with(APP_DIR));
    }

    #[test]
    fn test_default_files() {
        let store = get_default_store_path();
        assert_eq!(store.file_name().unwrap(), "secrets.db");
        assert!(store.starts_with(get_data_dir()));

        let config = get_default_config_path();
        assert_eq!(config.file_name().unwrap(), "twofold.toml");
    }
}
