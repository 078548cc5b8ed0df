//! Cache key layout for fences and their companion signals

use crate::state::RunKey;

pub const FENCE_PREFIX: &str = "indexfence_";
pub const LIVENESS_PREFIX: &str = "indexactive_";
pub const PROGRESS_PREFIX: &str = "indexprogress_";
pub const STOP_PREFIX: &str = "indexstop_";
pub const HEARTBEAT_PREFIX: &str = "heartbeat_";

/// Set of every fence key ever registered and not yet torn down
pub const ACTIVE_FENCES: &str = "active_fences";

/// Serializes fence creation decisions across schedulers
pub const CREATE_LOCK: &str = "lock_indexing_create";

/// Serializes validator sweeps
pub const VALIDATE_LOCK: &str = "lock_indexing_validate";

pub fn fence_key(key: RunKey) -> String {
    format!("{}{}", FENCE_PREFIX, key)
}

pub fn liveness_key(key: RunKey) -> String {
    format!("{}{}", LIVENESS_PREFIX, key)
}

pub fn progress_key(key: RunKey) -> String {
    format!("{}{}", PROGRESS_PREFIX, key)
}

pub fn stop_key(key: RunKey) -> String {
    format!("{}{}", STOP_PREFIX, key)
}

pub fn heartbeat_key(role: &str) -> String {
    format!("{}{}", HEARTBEAT_PREFIX, role)
}

/// Decodes the run key from a fence key
///
/// Returns None for anything not written by `fence_key`, including keys from a
/// future layout; such keys must be skipped, never deleted.
pub fn parse_fence_key(fence_key: &str) -> Option<RunKey> {
    fence_key
        .strip_prefix(FENCE_PREFIX)
        .and_then(RunKey::parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_key_round_trip() {
        let key = RunKey::new(12, 3);
        assert_eq!(fence_key(key), "indexfence_12/3");
        assert_eq!(parse_fence_key(&fence_key(key)), Some(key));
    }

    #[test]
    fn test_malformed_fence_keys() {
        assert_eq!(parse_fence_key("indexfence_12"), None);
        assert_eq!(parse_fence_key("indexfence_a/b"), None);
        assert_eq!(parse_fence_key("indexfence_1/2/3"), None);
        assert_eq!(parse_fence_key("indexactive_1/2"), None);
        assert_eq!(parse_fence_key(""), None);
    }
}
