//! Configuration module for Fenceline
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use fenceline::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("fenceline.toml")).unwrap();
//! println!("Liveness TTL: {}s", config.coordination.liveness_ttl_secs);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, CoordinationConfig, GenerationEntry, QueueConfig, SchedulerConfig, SourceEntry,
    StorageConfig, ValidatorConfig, WorkerConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash};
