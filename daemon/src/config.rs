use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Environment variable that forces debug logging on, overriding the config file.
pub const DEBUG_ENV_VAR: &str = "PRESENCED_DEBUG";
/// Environment variable overriding the on-disk games database path.
pub const DATABASE_ENV_VAR: &str = "PRESENCED_DATABASE";

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Root configuration structure. Deserialized from config.toml in the app data dir.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Overrides the default games database cache location.
    #[serde(default)]
    pub database_path: Option<String>,
    /// Enables verbose scan and transport logging.
    #[serde(default)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            debug: false,
        }
    }
}

impl Config {
    /// Applies environment overrides on top of whatever the config file said.
    /// `PRESENCED_DEBUG=1` enables debug logging; `PRESENCED_DATABASE=<path>`
    /// relocates the database cache.
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var(DEBUG_ENV_VAR) {
            self.debug = val == "1" || val.eq_ignore_ascii_case("true");
        }
        if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
            if !path.is_empty() {
                self.database_path = Some(path);
            }
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Records the effective debug toggle for the process lifetime.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

/// True when verbose logging was requested via config or environment.
pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn default_config_has_no_overrides() {
        let c = Config::default();
        assert!(c.database_path.is_none());
        assert!(!c.debug);
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_or_default(&path).unwrap();
        assert!(config.database_path.is_none());
        assert!(!config.debug);
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "database_path = \"/var/lib/presenced/games.json\"\ndebug = true\n")
            .unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(
            config.database_path.as_deref(),
            Some("/var/lib/presenced/games.json")
        );
        assert!(config.debug);
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "debug = true\n").unwrap();

        let config = load_or_default(&path).unwrap();
        assert!(config.debug);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not valid toml ][[[").unwrap();
        assert!(load_or_default(&path).is_err());
    }

    // ── debug toggle ──────────────────────────────────────────────────────────

    #[test]
    fn set_debug_round_trips() {
        set_debug(true);
        assert!(debug_enabled());
        set_debug(false);
        assert!(!debug_enabled());
    }
}
