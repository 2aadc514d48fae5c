use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;

use crate::error::Result;

use super::signature;

/// A named, trusted Ed25519 public key.
#[derive(Debug, Clone)]
pub struct Key {
    name: String,
    public_key: VerifyingKey,
    fingerprint: String,
}

impl Key {
    pub fn new(name: impl Into<String>, public_key: VerifyingKey) -> Self {
        let fingerprint = signature::fingerprint(&public_key);
        Self {
            name: name.into(),
            public_key,
            fingerprint,
        }
    }

    /// Build a key from PEM material (either accepted block type).
    pub fn from_pem(name: impl Into<String>, pem: &[u8]) -> Result<Self> {
        Ok(Self::new(name, signature::parse_public_key_pem(pem)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// In-memory set of trusted keys indexed by fingerprint.
///
/// Insertion happens at construction time; afterwards the ring is read-only
/// and shared freely across fetch callers.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: HashMap<String, Key>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: impl IntoIterator<Item = Key>) -> Self {
        let mut ring = Self::new();
        for key in keys {
            ring.add(key);
        }
        ring
    }

    /// Register a key. A key with the same fingerprint replaces the old one.
    pub fn add(&mut self, key: Key) {
        self.keys.insert(key.fingerprint().to_string(), key);
    }

    pub fn find(&self, fingerprint: &str) -> Option<&Key> {
        self.keys.get(fingerprint)
    }

    pub fn names(&self) -> Vec<&str> {
        self.keys.values().map(Key::name).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn key(name: &str, seed: u8) -> Key {
        Key::new(name, SigningKey::from_bytes(&[seed; 32]).verifying_key())
    }

    #[test]
    fn finds_keys_by_fingerprint() {
        let ring = Keyring::with_keys([key("release", 1), key("staging", 2)]);
        let fp = key("release", 1).fingerprint().to_string();
        assert_eq!(ring.find(&fp).unwrap().name(), "release");
        assert!(ring.find("00").is_none());
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn same_fingerprint_replaces() {
        let mut ring = Keyring::new();
        ring.add(key("old-name", 5));
        ring.add(key("new-name", 5));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.names(), vec!["new-name"]);
    }
}
