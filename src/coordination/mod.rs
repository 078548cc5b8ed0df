//! Coordination cache shared by schedulers, validators, and workers
//!
//! The cache is the only state these processes share besides the durable attempt
//! records and the checkpoint store. It is atomic only at single-key granularity.
//!
//! # Components
//!
//! - `CoordinationCache`: the key-value contract (conditional writes, TTLs, sets)
//! - `MemoryCache`: in-process implementation for tests and single-process deployments
//! - `SqliteCache`: file-backed implementation shared across processes
//! - `CacheLock`: advisory lock with an owner token and a TTL

mod lock;
mod memory;
mod sqlite;
mod traits;

pub use lock::CacheLock;
pub use memory::MemoryCache;
pub use sqlite::SqliteCache;
pub use traits::{CacheError, CacheResult, CoordinationCache};
