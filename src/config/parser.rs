use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;
use url::Url;

/// Environment variable naming the queue broker host
pub const ENV_QUEUE_HOST: &str = "QUEUE_HOST";

/// Environment variable carrying a full queue broker URL
pub const ENV_QUEUE_URL: &str = "QUEUE_URL";

/// Environment variable carrying the record store URL
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

/// Environment variable naming the proxy list file
pub const ENV_PROXY_FILE: &str = "PROXY_FILE";

/// Loads and parses a configuration file from the given path
///
/// Environment overrides are applied after parsing and before validation.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use pubcrawl::config::load_config;
///
/// let config = load_config(Path::new("pubcrawl.toml")).unwrap();
/// println!("Workers: {}", config.worker.count);
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut config: Config = toml::from_str(&content)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Builds a configuration from defaults plus environment overrides
///
/// Used when no configuration file is given on the command line.
pub fn load_default_config() -> Result<Config, ConfigError> {
    let mut config = Config::default();
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Applies the process-level environment surface to a configuration
///
/// `QUEUE_URL` replaces the broker URL outright; `QUEUE_HOST` only swaps the
/// host of whatever URL is configured. `lookup` abstracts the environment so
/// tests do not have to mutate process state.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup(ENV_QUEUE_URL) {
        config.queue.url = url;
    }

    if let Some(host) = lookup(ENV_QUEUE_HOST) {
        let mut url = Url::parse(&config.queue.url)
            .map_err(|e| ConfigError::InvalidUrl(format!("queue url: {}", e)))?;
        url.set_host(Some(&host))
            .map_err(|e| ConfigError::InvalidUrl(format!("queue host '{}': {}", host, e)))?;
        config.queue.url = url.to_string();
    }

    if let Some(db) = lookup(ENV_DATABASE_URL) {
        config.database.url = db;
    }

    if let Some(file) = lookup(ENV_PROXY_FILE) {
        config.proxy.file = file;
    }

    Ok(())
}

/// Computes a SHA-256 hash of the configuration file content
///
/// Logged at startup so separate processes can confirm they share a config.
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    Ok(hex::encode(result))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}
