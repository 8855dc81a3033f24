//! Load configuration from XDG `config.toml` and project `.env`, then apply to the
//! process environment with priority: **existing env > .env > XDG**.
//!
//! The server and CLI read everything (`DATABASE_URL`, `GEMINI_API_KEY`, ...) from
//! the environment; this crate is the single place that fills it in.

mod dotenv;
mod xdg_toml;

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Loads config from `~/.config/<app_name>/config.toml` (`[env]` table) and an
/// optional project `.env`, then sets environment variables only for keys that
/// are **not** already set, so the existing environment always wins.
///
/// When a key is missing from the process environment, the value comes from:
/// 1. the project `.env` (current directory, or `override_dir` if given)
/// 2. the XDG `config.toml` `[env]` table
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg_map = xdg_toml::load_env_map(app_name)?;
    let dotenv_map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    let mut keys: std::collections::HashSet<String> = xdg_map.keys().cloned().collect();
    keys.extend(dotenv_map.keys().cloned());

    for key in keys {
        if std::env::var(&key).is_ok() {
            continue; // existing env wins
        }
        if let Some(value) = dotenv_map.get(&key).or_else(|| xdg_map.get(&key)) {
            std::env::set_var(&key, value);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn restore_var(key: &str, prev: Option<String>) {
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn existing_env_wins() {
        env::set_var("ARBOR_CONFIG_TEST_EXISTING", "from_env");
        let _ = load_and_apply("arbor", None);
        assert_eq!(
            env::var("ARBOR_CONFIG_TEST_EXISTING").as_deref(),
            Ok("from_env")
        );
        env::remove_var("ARBOR_CONFIG_TEST_EXISTING");
    }

    #[test]
    fn load_and_apply_without_any_config_is_ok() {
        let r = load_and_apply("arbor-config-nonexistent-app-xyz", None);
        assert!(r.is_ok());
    }

    #[test]
    fn dotenv_overrides_xdg() {
        let xdg_dir = tempfile::tempdir().unwrap();
        let app_dir = xdg_dir.path().join("arbor");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("config.toml"),
            "[env]\nARBOR_CONFIG_TEST_PRIORITY = \"from_xdg\"\n",
        )
        .unwrap();

        let dotenv_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dotenv_dir.path().join(".env"),
            "ARBOR_CONFIG_TEST_PRIORITY=from_dotenv\n",
        )
        .unwrap();

        let prev_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", xdg_dir.path());
        env::remove_var("ARBOR_CONFIG_TEST_PRIORITY");

        let _ = load_and_apply("arbor", Some(dotenv_dir.path()));
        let val = env::var("ARBOR_CONFIG_TEST_PRIORITY").unwrap();
        env::remove_var("ARBOR_CONFIG_TEST_PRIORITY");
        restore_var("XDG_CONFIG_HOME", prev_xdg);

        assert_eq!(val, "from_dotenv");
    }

    #[test]
    fn dotenv_only_when_no_xdg() {
        let dotenv_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dotenv_dir.path().join(".env"),
            "ARBOR_CONFIG_TEST_DOTENV_ONLY=from_dotenv_only\n",
        )
        .unwrap();

        env::remove_var("ARBOR_CONFIG_TEST_DOTENV_ONLY");
        let _ = load_and_apply("arbor-config-nonexistent-app-xyz", Some(dotenv_dir.path()));
        let val = env::var("ARBOR_CONFIG_TEST_DOTENV_ONLY").unwrap();
        env::remove_var("ARBOR_CONFIG_TEST_DOTENV_ONLY");

        assert_eq!(val, "from_dotenv_only");
    }
}
