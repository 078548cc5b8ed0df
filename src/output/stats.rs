//! Statistics generation from the attempt database
//!
//! This module provides functionality for extracting and displaying
//! run attempt statistics from the storage layer.

use crate::state::AttemptStatus;
use crate::storage::{AttemptErrorRecord, AttemptStore};
use crate::FencelineError;
use std::collections::HashMap;

/// Number of recent scoped failures included in the statistics
const RECENT_ERROR_LIMIT: usize = 10;

/// Attempt statistics summary
#[derive(Debug, Clone)]
pub struct AttemptStatistics {
    /// Total number of attempts recorded
    pub total_attempts: u64,

    /// Count of attempts by status
    pub attempts_by_status: HashMap<AttemptStatus, u64>,

    /// Number of configured sources
    pub sources: u64,

    /// Sources currently in repeated-error mode
    pub sources_in_error: Vec<String>,

    /// Newest scoped failures across all attempts
    pub recent_errors: Vec<AttemptErrorRecord>,
}

impl AttemptStatistics {
    pub fn count(&self, status: AttemptStatus) -> u64 {
        self.attempts_by_status.get(&status).copied().unwrap_or(0)
    }

    /// Percentage of terminal attempts that ended SUCCESS or PARTIALLY_SUCCEEDED
    pub fn success_rate(&self) -> f64 {
        let terminal: u64 = self
            .attempts_by_status
            .iter()
            .filter(|(status, _)| status.is_terminal())
            .map(|(_, count)| count)
            .sum();
        if terminal == 0 {
            return 0.0;
        }
        let succeeded =
            self.count(AttemptStatus::Success) + self.count(AttemptStatus::PartiallySucceeded);
        (succeeded as f64 / terminal as f64) * 100.0
    }
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
///
/// # Returns
///
/// * `Ok(AttemptStatistics)` - Successfully loaded statistics
/// * `Err(FencelineError)` - Failed to query statistics
pub fn load_statistics(storage: &dyn AttemptStore) -> Result<AttemptStatistics, FencelineError> {
    let attempts_by_status = storage.count_attempts_by_status()?;
    let total_attempts = attempts_by_status.values().sum();

    let sources = storage.list_sources()?;
    let sources_in_error = sources
        .iter()
        .filter(|source| source.in_repeated_error_state)
        .map(|source| source.name.clone())
        .collect();

    let recent_errors = storage.get_recent_errors(RECENT_ERROR_LIMIT)?;

    Ok(AttemptStatistics {
        total_attempts,
        attempts_by_status,
        sources: sources.len() as u64,
        sources_in_error,
        recent_errors,
    })
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &AttemptStatistics) {
    println!("=== Indexing Statistics ===\n");

    println!("Overview:");
    println!("  Sources: {}", stats.sources);
    println!("  Total attempts: {}", stats.total_attempts);
    println!();

    println!("Attempts by Status:");
    let mut status_counts: Vec<_> = stats.attempts_by_status.iter().collect();
    status_counts.sort_by(|a, b| b.1.cmp(a.1));

    for (status, count) in status_counts {
        let percentage = if stats.total_attempts > 0 {
            (*count as f64 / stats.total_attempts as f64) * 100.0
        } else {
            0.0
        };
        println!("  {}: {} ({:.1}%)", status, count, percentage);
    }
    println!();

    if !stats.sources_in_error.is_empty() {
        println!(
            "Sources in Repeated-Error Mode ({}):",
            stats.sources_in_error.len()
        );
        for name in &stats.sources_in_error {
            println!("  - {}", name);
        }
        println!();
    }

    if !stats.recent_errors.is_empty() {
        println!("Recent Failures:");
        for error in &stats.recent_errors {
            let target = error
                .failure
                .document_id
                .as_deref()
                .or(error.failure.entity_id.as_deref())
                .unwrap_or("-");
            println!(
                "  [{}] attempt {} {}: {}",
                error.created_at.format("%Y-%m-%d %H:%M:%S"),
                error.attempt_id,
                target,
                error.failure.message
            );
        }
        println!();
    }

    println!("Success Rate: {:.1}% of finished attempts", stats.success_rate());
}
