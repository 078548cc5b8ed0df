//! Fence Manager
//!
//! One fence per (source, generation) in the coordination cache marks a run as
//! active. Companion keys carry the liveness signal, the progress counter, and
//! the cooperative stop flag.

pub mod keys;
mod manager;

pub use keys::{fence_key, parse_fence_key};
pub use manager::{FenceGuard, FenceHandle, FenceManager, FencePayload, FenceRecord};
