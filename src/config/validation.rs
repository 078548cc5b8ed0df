use crate::config::types::{
    Config, CoordinationConfig, GenerationEntry, QueueConfig, SchedulerConfig, SourceEntry,
    StorageConfig, WorkerConfig,
};
use crate::connector::KNOWN_CONNECTORS;
use crate::state::GenerationStatus;
use crate::ConfigError;
use std::collections::HashSet;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_coordination_config(&config.coordination)?;
    validate_storage_config(&config.storage)?;
    validate_queue_config(&config.queue, &config.worker)?;
    validate_scheduler_config(&config.scheduler)?;
    validate_worker_config(&config.worker)?;

    if config.validator.interval_secs == 0 {
        return Err(ConfigError::Validation(
            "validator interval_secs must be >= 1".to_string(),
        ));
    }

    validate_sources(&config.sources)?;
    validate_generations(&config.generations)?;
    Ok(())
}

/// Validates coordination cache configuration
fn validate_coordination_config(config: &CoordinationConfig) -> Result<(), ConfigError> {
    if config.cache_path.is_empty() {
        return Err(ConfigError::Validation(
            "cache_path cannot be empty".to_string(),
        ));
    }

    // Liveness is renewed every third of its TTL, which must stay >= 1s
    if config.liveness_ttl_secs < 3 {
        return Err(ConfigError::Validation(format!(
            "liveness_ttl_secs must be >= 3, got {}",
            config.liveness_ttl_secs
        )));
    }

    if config.lock_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "lock_timeout_secs must be >= 1".to_string(),
        ));
    }

    if config.heartbeat_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "heartbeat_ttl_secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates storage configuration
fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.checkpoint_dir.is_empty() {
        return Err(ConfigError::Validation(
            "checkpoint_dir cannot be empty".to_string(),
        ));
    }

    if config.checkpoint_size_limit < 1024 {
        return Err(ConfigError::Validation(format!(
            "checkpoint_size_limit must be >= 1024 bytes, got {}",
            config.checkpoint_size_limit
        )));
    }

    if config.checkpoint_retention_days == 0 {
        return Err(ConfigError::Validation(
            "checkpoint_retention_days must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates task queue configuration
fn validate_queue_config(config: &QueueConfig, worker: &WorkerConfig) -> Result<(), ConfigError> {
    if config.name.is_empty() {
        return Err(ConfigError::Validation(
            "queue name cannot be empty".to_string(),
        ));
    }

    // A task redelivered while its first worker is still inside the hard timeout
    // would look alive to the validator for the whole overlap
    if config.visibility_timeout_secs < worker.hard_timeout_secs {
        return Err(ConfigError::Validation(format!(
            "visibility_timeout_secs ({}) must be >= hard_timeout_secs ({})",
            config.visibility_timeout_secs, worker.hard_timeout_secs
        )));
    }

    Ok(())
}

/// Validates scheduler configuration
fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.beat_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "beat_interval_secs must be >= 1".to_string(),
        ));
    }

    if config.repeated_error_threshold == 0 {
        return Err(ConfigError::Validation(
            "repeated_error_threshold must be >= 1".to_string(),
        ));
    }

    if config.poll_offset_minutes < 0 {
        return Err(ConfigError::Validation(format!(
            "poll_offset_minutes cannot be negative, got {}",
            config.poll_offset_minutes
        )));
    }

    Ok(())
}

/// Validates worker configuration
fn validate_worker_config(config: &WorkerConfig) -> Result<(), ConfigError> {
    if config.max_crawl_workers < 1 || config.max_crawl_workers > 64 {
        return Err(ConfigError::Validation(format!(
            "max_crawl_workers must be between 1 and 64, got {}",
            config.max_crawl_workers
        )));
    }

    if config.checkpoint_every == 0 {
        return Err(ConfigError::Validation(
            "checkpoint_every must be >= 1".to_string(),
        ));
    }

    if config.fence_wait_timeout_secs == 0 || config.hard_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "fence_wait_timeout_secs and hard_timeout_secs must be >= 1".to_string(),
        ));
    }

    if !(config.failure_ratio > 0.0 && config.failure_ratio <= 1.0) {
        return Err(ConfigError::Validation(format!(
            "failure_ratio must be in (0, 1], got {}",
            config.failure_ratio
        )));
    }

    if config.retry_max_attempts == 0 {
        return Err(ConfigError::Validation(
            "retry_max_attempts must be >= 1".to_string(),
        ));
    }

    if config.retry_base_delay_ms > config.retry_max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "retry_base_delay_ms ({}) cannot exceed retry_max_delay_ms ({})",
            config.retry_base_delay_ms, config.retry_max_delay_ms
        )));
    }

    Ok(())
}

/// Validates source entries
fn validate_sources(sources: &[SourceEntry]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    let mut identities = HashSet::new();

    for source in sources {
        if source.name.is_empty() {
            return Err(ConfigError::Validation(
                "source name cannot be empty".to_string(),
            ));
        }

        if !names.insert(source.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate source name '{}'",
                source.name
            )));
        }

        if !KNOWN_CONNECTORS.contains(&source.connector.as_str()) {
            return Err(ConfigError::UnknownConnector(source.connector.clone()));
        }

        if source.credential.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Source '{}' must name a credential",
                source.name
            )));
        }

        if !identities.insert((source.connector.as_str(), source.credential.as_str())) {
            return Err(ConfigError::Validation(format!(
                "Source '{}' duplicates connector '{}' with credential '{}'",
                source.name, source.connector, source.credential
            )));
        }

        if source.root.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Source '{}' must have a root",
                source.name
            )));
        }

        if source.refresh_freq_secs == Some(0) {
            return Err(ConfigError::Validation(format!(
                "Source '{}' refresh_freq_secs must be >= 1 when set",
                source.name
            )));
        }
    }

    Ok(())
}

/// Validates index generation entries
fn validate_generations(generations: &[GenerationEntry]) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    let mut present = 0;

    for generation in generations {
        let status = GenerationStatus::from_db_string(&generation.status).ok_or_else(|| {
            ConfigError::Validation(format!(
                "Generation {} has unknown status '{}'",
                generation.id, generation.status
            ))
        })?;

        if status == GenerationStatus::Present {
            present += 1;
        }

        if !ids.insert(generation.id) {
            return Err(ConfigError::Validation(format!(
                "Duplicate generation id {}",
                generation.id
            )));
        }
    }

    if present > 1 {
        return Err(ConfigError::Validation(format!(
            "At most one generation can be present, found {}",
            present
        )));
    }

    Ok(())
}
