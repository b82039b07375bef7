//! Configuration and file management for the DAK workflow coordinator
//!
//! This crate provides:
//! - File path utilities for config and cache files
//! - Configuration file lookup (TOML)
//! - Coordinator configuration (polling cadence, expiry delays, SSO waits)

pub mod config_file;
pub mod coordinator_config;
pub mod paths;

/// Default repository host (public GitHub)
pub const DEFAULT_HOST: &str = "github.com";

pub use config_file::{load_config_file, ConfigError};
pub use coordinator_config::{ActionConfig, CoordinatorConfig, PollingConfig, SsoConfig};
pub use paths::{cache_dir, config_dir, log_file_path};
