//! Configuration validation.

use std::collections::HashSet;

use crate::error::ConfigError;
use crate::schema::Config;

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Convert the first error into a `ConfigError`.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        match self.errors.into_iter().next() {
            Some(err) => Err(ConfigError::InvalidValue {
                field: err.path,
                message: err.message,
            }),
            None => Ok(self.warnings),
        }
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_store(config, &mut result);
        Self::validate_queues(config, &mut result);
        Self::validate_retention(config, &mut result);

        result
    }

    fn validate_store(config: &Config, result: &mut ValidationResult) {
        if config.store.path.as_os_str().is_empty() {
            result.add_error(ValidationError::new("store.path", "Path cannot be empty"));
        }
    }

    fn validate_queues(config: &Config, result: &mut ValidationResult) {
        if config.queues.retry_limit == 0 {
            result.add_error(ValidationError::new(
                "queues.retry_limit",
                "retry_limit must be greater than 0",
            ));
        }

        // 2^31 seconds of backoff is already past any useful schedule
        if config.queues.retry_limit > 30 {
            result.add_warning(ValidationWarning::new(
                "queues.retry_limit",
                format!(
                    "retry_limit {} produces backoff delays of many years",
                    config.queues.retry_limit
                ),
            ));
        }

        if config.queues.names.is_empty() {
            result.add_warning(ValidationWarning::new(
                "queues.names",
                "No queues are created at startup; queues will be created on first enqueue",
            ));
        }

        let mut seen = HashSet::new();
        for (i, name) in config.queues.names.iter().enumerate() {
            if name.trim().is_empty() {
                result.add_error(ValidationError::new(
                    format!("queues.names[{}]", i),
                    "Queue name cannot be empty",
                ));
            } else if !seen.insert(name.as_str()) {
                result.add_warning(ValidationWarning::new(
                    format!("queues.names[{}]", i),
                    format!("Duplicate queue name '{}'", name),
                ));
            }
        }
    }

    fn validate_retention(config: &Config, result: &mut ValidationResult) {
        if config.retention.sweep_on_start {
            if config.retention.task_days == 0 {
                result.add_warning(ValidationWarning::new(
                    "retention.task_days",
                    "task_days = 0 purges every task on startup",
                ));
            }
            if config.retention.event_days == 0 {
                result.add_warning(ValidationWarning::new(
                    "retention.event_days",
                    "event_days = 0 purges every event on startup",
                ));
            }
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
