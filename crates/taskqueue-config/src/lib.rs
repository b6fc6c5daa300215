//! # TaskQueue Config
//!
//! Configuration for the task queue: store location, queue set, retry
//! policy, retention and logging.

mod error;
mod loader;
mod schema;
mod validator;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::{ConfigValidator, ValidationError, ValidationResult, ValidationWarning};
