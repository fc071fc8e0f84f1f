//! Identifier newtypes shared across the engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the signed-in user that owns anchors and sessions
///
/// Every persisted cursor is keyed by this value so that switching
/// accounts can never resume from another user's read position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserKey(pub String);

impl UserKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the key for a backend user id
    pub fn for_user(user_id: &str) -> Self {
        Self(format!("user:{}", user_id.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical health data type identifier (e.g. "steps", "heartRate")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataTypeId(pub String);

impl DataTypeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DataTypeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DataTypeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DataTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque read position returned by a health source
///
/// The engine never interprets the contents; it only stores the value
/// once the samples read before it have been accepted by the backend.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Anchors are often large base64 blobs
        if self.0.len() > 32 {
            let prefix: String = self.0.chars().take(32).collect();
            write!(f, "Cursor({}…, {} bytes)", prefix, self.0.len())
        } else {
            write!(f, "Cursor({})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_key_for_user() {
        assert_eq!(UserKey::for_user("abc").as_str(), "user:abc");
        assert_eq!(UserKey::for_user(" abc "), UserKey::for_user("abc"));
    }

    #[test]
    fn test_cursor_debug_truncates() {
        let long = Cursor::new("x".repeat(100));
        let debug = format!("{:?}", long);
        assert!(debug.contains("100 bytes"));
        assert!(debug.len() < 80);

        let short = Cursor::new("42");
        assert_eq!(format!("{:?}", short), "Cursor(42)");
    }
}
