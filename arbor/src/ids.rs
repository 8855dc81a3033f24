//! Opaque identifiers and wall-clock helpers shared by the engine and logs.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Fresh opaque id (uuid v4 hex, no structure encoded). Used for trace ids,
/// tool execution ids, and task-group ids.
pub fn opaque_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_ids_are_hex_and_unique() {
        let a = opaque_id();
        let b = opaque_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
