//! Configuration loader.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ConfigError;
use crate::schema::Config;

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid"));

/// Configuration loader with environment variable substitution.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a file, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        Self::load(path)
    }

    /// Load configuration from a string.
    pub fn load_str(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let mut config: Config = toml::from_str(&expanded)?;
        config.store.path = Self::expand_pathbuf(&config.store.path);
        config.logging.dir = config.logging.dir.as_deref().map(Self::expand_pathbuf);
        Ok(config)
    }

    /// Expand environment variables in the format `${VAR}`.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let mut result = content.to_string();

        for cap in ENV_VAR.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.taskqueue`).
    pub fn expand_path(path: &str) -> String {
        shellexpand::tilde(path).to_string()
    }

    fn expand_pathbuf(path: &Path) -> PathBuf {
        match path.to_str() {
            Some(s) => PathBuf::from(Self::expand_path(s)),
            None => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_empty_config() {
        let config = ConfigLoader::load_str("").unwrap();
        assert_eq!(config.queues.retry_limit, 15);
        assert_eq!(config.queues.names.len(), 2);
    }

    #[test]
    fn test_load_basic_config() {
        let content = r#"
            [store]
            path = "/var/lib/taskqueue/tasks.db"

            [queues]
            names = ["main"]
            retry_limit = 5
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/var/lib/taskqueue/tasks.db"));
        assert_eq!(config.queues.names, vec!["main"]);
        assert_eq!(config.queues.retry_limit, 5);
    }

    #[test]
    fn test_load_retention_and_logging() {
        let content = r#"
            [retention]
            task_days = 3
            event_days = 1
            sweep_on_start = true

            [logging]
            level = "debug"
            dir = "/tmp/taskqueue-logs"
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.retention.task_days, 3);
        assert_eq!(config.retention.event_days, 1);
        assert!(config.retention.sweep_on_start);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.dir, Some(PathBuf::from("/tmp/taskqueue-logs")));
    }

    #[test]
    fn test_store_path_tilde_is_expanded() {
        let content = r#"
            [store]
            path = "~/queue.db"
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert!(!config.store.path.to_string_lossy().starts_with('~'));
        assert!(config.store.path.ends_with("queue.db"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[queues]").unwrap();
        writeln!(file, "retry_limit = 7").unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.queues.retry_limit, 7);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = ConfigLoader::load(Path::new("/nonexistent/path/taskqueue.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config =
            ConfigLoader::load_or_default(Path::new("/nonexistent/path/taskqueue.toml")).unwrap();
        assert_eq!(config.queues.retry_limit, 15);
    }

    #[test]
    fn test_load_invalid_toml() {
        let result = ConfigLoader::load_str("invalid = [unclosed");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: This test runs in isolation and sets a unique test-only env var
        unsafe {
            std::env::set_var("TASKQUEUE_TEST_DB_DIR", "/srv/queue");
        }
        let content = "[store]\npath = \"${TASKQUEUE_TEST_DB_DIR}/tasks.db\"";
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/srv/queue/tasks.db"));
        unsafe {
            std::env::remove_var("TASKQUEUE_TEST_DB_DIR");
        }
    }

    #[test]
    fn test_expand_env_vars_not_set() {
        let content = "value = \"${TASKQUEUE_NONEXISTENT_VAR_12345}\"";
        let result = ConfigLoader::expand_env_vars(content);
        assert!(matches!(result, Err(ConfigError::EnvVarNotSet(_))));
    }

    #[test]
    fn test_expand_path_no_tilde() {
        let path = "/usr/local/var/taskqueue.db";
        assert_eq!(ConfigLoader::expand_path(path), path);
    }
}
