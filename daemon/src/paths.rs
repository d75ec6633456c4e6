//! Canonical file and socket locations for presenced data.
//!
//! The app data directory holds:
//!   - config.toml  Optional user configuration.
//!   - games.json   Cached copy of the detectable-games database.

use std::path::PathBuf;

const APP_DIR_NAME: &str = "presenced";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DATABASE_FILE_NAME: &str = "games.json";

/// Returns the presenced application data directory.
///
/// %APPDATA%\presenced\ on Windows, $XDG_CONFIG_HOME/presenced (falling back
/// to ~/.config/presenced) elsewhere.
pub fn app_data_dir() -> PathBuf {
    #[cfg(windows)]
    {
        let appdata = std::env::var("APPDATA").expect("APPDATA environment variable not set");
        PathBuf::from(appdata).join(APP_DIR_NAME)
    }
    #[cfg(not(windows))]
    {
        match std::env::var("XDG_CONFIG_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir).join(APP_DIR_NAME),
            _ => {
                let home = std::env::var("HOME").expect("HOME environment variable not set");
                PathBuf::from(home).join(".config").join(APP_DIR_NAME)
            }
        }
    }
}

/// Returns the full path to the config file.
pub fn config_file_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

/// Returns the full path to the on-disk games database cache.
pub fn database_file_path() -> PathBuf {
    app_data_dir().join(DATABASE_FILE_NAME)
}

/// Directory under which the native IPC sockets live on Unix:
/// $XDG_RUNTIME_DIR, then $TMPDIR, then /tmp.
#[cfg(unix)]
pub fn socket_dir() -> PathBuf {
    for var in ["XDG_RUNTIME_DIR", "TMPDIR"] {
        if let Ok(dir) = std::env::var(var) {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
    }
    PathBuf::from("/tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_ends_with_presenced() {
        let dir = app_data_dir();
        assert_eq!(dir.file_name().unwrap(), "presenced");
    }

    #[test]
    fn config_file_path_has_correct_name() {
        let path = config_file_path();
        assert_eq!(path.file_name().unwrap(), CONFIG_FILE_NAME);
    }

    #[test]
    fn database_file_path_has_correct_name() {
        let path = database_file_path();
        assert_eq!(path.file_name().unwrap(), DATABASE_FILE_NAME);
    }

    #[test]
    fn config_and_database_share_same_parent_dir() {
        let config = config_file_path();
        let database = database_file_path();
        assert_eq!(config.parent(), database.parent());
    }

    #[cfg(unix)]
    #[test]
    fn socket_dir_is_absolute() {
        assert!(socket_dir().is_absolute());
    }
}
