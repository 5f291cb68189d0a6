//! Configuration module for pubcrawl
//!
//! This module handles loading, parsing, and validating TOML configuration
//! files, and layering the process environment on top.
//!
//! # Example
//!
//! ```no_run
//! use pubcrawl::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("pubcrawl.toml")).unwrap();
//! println!("Crawler will start {} workers", config.worker.count);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, CoordinatorConfig, DatabaseConfig, ProxyConfig, QueueConfig, WorkerConfig,
};

// Re-export parser functions
pub use parser::{
    apply_env_overrides, compute_config_hash, load_config, load_config_with_hash,
    load_default_config, ENV_DATABASE_URL, ENV_PROXY_FILE, ENV_QUEUE_HOST, ENV_QUEUE_URL,
};
pub use validation::validate;
