use crate::config::types::{Config, CoordinatorConfig, DatabaseConfig, QueueConfig, WorkerConfig};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_queue_config(&config.queue)?;
    validate_database_config(&config.database)?;
    validate_worker_config(&config.worker)?;
    validate_coordinator_config(&config.coordinator)?;
    Ok(())
}

/// Validates message broker configuration
fn validate_queue_config(config: &QueueConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid queue url: {}", e)))?;

    if url.scheme() != "amqp" && url.scheme() != "amqps" {
        return Err(ConfigError::InvalidUrl(format!(
            "Queue url must use amqp or amqps scheme, got '{}'",
            url.scheme()
        )));
    }

    if config.task_queue.is_empty() || config.result_queue.is_empty() {
        return Err(ConfigError::Validation(
            "task-queue and result-queue cannot be empty".to_string(),
        ));
    }

    if config.task_queue == config.result_queue {
        return Err(ConfigError::Validation(format!(
            "task-queue and result-queue must differ, both are '{}'",
            config.task_queue
        )));
    }

    Ok(())
}

fn validate_database_config(config: &DatabaseConfig) -> Result<(), ConfigError> {
    if config.path().is_empty() {
        return Err(ConfigError::Validation(
            "database url cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Validates worker configuration
fn validate_worker_config(config: &WorkerConfig) -> Result<(), ConfigError> {
    if config.count < 1 || config.count > 64 {
        return Err(ConfigError::Validation(format!(
            "worker count must be between 1 and 64, got {}",
            config.count
        )));
    }

    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(
            "max-attempts must be >= 1".to_string(),
        ));
    }

    if config.request_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "request-timeout-secs must be >= 1".to_string(),
        ));
    }

    if config.heartbeat_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "heartbeat-interval-secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates coordinator configuration
fn validate_coordinator_config(config: &CoordinatorConfig) -> Result<(), ConfigError> {
    if config.max_retry_delay_secs < config.base_retry_delay_secs {
        return Err(ConfigError::Validation(format!(
            "max-retry-delay-secs ({}) must be >= base-retry-delay-secs ({})",
            config.max_retry_delay_secs, config.base_retry_delay_secs
        )));
    }

    if config.google_interval_days < 1 || config.dblp_interval_days < 1 {
        return Err(ConfigError::Validation(
            "re-crawl intervals must be at least one day".to_string(),
        ));
    }

    Ok(())
}
