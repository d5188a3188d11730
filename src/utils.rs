//! # Utility Functions
//!
//! Small helpers shared across the binary. The teacher's `core_affinity`-based
//! `spawn_with_affinity` has no counterpart in this benchmark (every rank's
//! work is already one `tokio` task tree, see `comm`/`gap`/`channel_runner`)
//! and was dropped along with the `core_affinity` dependency (DESIGN.md).

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch, used to stamp JSON summary output.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_monotonic_nondecreasing_across_calls() {
        let first = current_timestamp_ns();
        let second = current_timestamp_ns();
        assert!(second >= first);
    }
}
