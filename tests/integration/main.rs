//! Integration tests for fenceline
//!
//! Each module drives several components together over in-memory or
//! tempdir-backed collaborators.

mod support;

mod exclusion_tests;
mod reconcile_tests;
mod resume_tests;
mod worker_tests;
