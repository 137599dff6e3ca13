//! Content keys.
//!
//! A [`StoreKey`] identifies one cached response. It is a stable 16-byte
//! digest of the request identity (method + URI), so the same request maps
//! to the same key across restarts and across the memory and disk tiers.

use sha1::{Digest, Sha1};
use std::fmt;

/// Length of a content key in bytes.
pub const KEY_LEN: usize = 16;

/// A stable 16-byte content key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey([u8; KEY_LEN]);

impl StoreKey {
    /// Compute the key for a request identity.
    pub fn for_request(method: &str, uri: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(method.as_bytes());
        hasher.update(b" ");
        hasher.update(uri.as_bytes());
        let digest = hasher.finalize();

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest[..KEY_LEN]);
        Self(key)
    }

    /// Construct a key from raw bytes (e.g. read back from disk).
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_stable() {
        let a = StoreKey::for_request("GET", "http://example.com/");
        let b = StoreKey::for_request("GET", "http://example.com/");
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_distinguishes_requests() {
        let a = StoreKey::for_request("GET", "http://example.com/");
        let b = StoreKey::for_request("GET", "http://example.com/other");
        let c = StoreKey::for_request("HEAD", "http://example.com/");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_round_trips_through_bytes() {
        let a = StoreKey::for_request("GET", "http://example.com/");
        let b = StoreKey::from_bytes(*a.as_bytes());
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_display_is_hex() {
        let key = StoreKey::from_bytes([0xAB; KEY_LEN]);
        assert_eq!(format!("{}", key), "AB".repeat(KEY_LEN));
    }
}
