//! Configuration Store (C3)
//!
//! Loads and saves runner registrations and daemon tuning from a single
//! JSON document.

mod errors;
mod store;
mod types;

pub use errors::{ConfigError, ConfigResult};
pub use store::ConfigStore;
pub use types::{DaemonConfiguration, RunnerRegistration, DEFAULT_LABEL};

#[allow(unused_imports)]
pub use types::default_reserved_labels;
