//! Session identifier type.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for session ID generation.
static COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a PowerShell session.
///
/// Session IDs are generated from an atomic counter, ensuring uniqueness
/// within a single process lifetime. The ID is displayed as `ps-XXXXXXXX`
/// where X is a hexadecimal digit, and also names the session's event-loop
/// thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a new unique session ID.
    pub fn new() -> Self {
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Create a SessionId from a raw u64 value.
    ///
    /// This is primarily for testing and deserialization.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ps-{:08x}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = crate::error::PwshBridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("ps-")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .map(SessionId)
            .ok_or_else(|| {
                crate::error::PwshBridgeError::InvalidRequest(format!("invalid session id: {s}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uniqueness() {
        let mut ids = HashSet::new();
        for _ in 0..10_000 {
            let id = SessionId::new();
            assert!(ids.insert(id), "Duplicate ID generated: {}", id);
        }
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_display_format() {
        let id = SessionId::from_raw(255);
        assert_eq!(id.to_string(), "ps-000000ff");

        let id2 = SessionId::from_raw(0x12345678);
        assert_eq!(id2.to_string(), "ps-12345678");
    }

    #[test]
    fn test_parse_valid() {
        let id: SessionId = "ps-000000ff".parse().unwrap();
        assert_eq!(id.as_u64(), 255);
    }

    #[test]
    fn test_parse_invalid() {
        assert!("000000ff".parse::<SessionId>().is_err());
        assert!("sess-000000ff".parse::<SessionId>().is_err());
        assert!("ps-gggggggg".parse::<SessionId>().is_err());
        assert!("".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_roundtrip() {
        let original = SessionId::new();
        let s = original.to_string();
        let parsed: SessionId = s.parse().unwrap();
        assert_eq!(original, parsed);
    }
}
