//! Watched wallet addresses and the address book.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Length in bytes of a decoded Solana public key.
pub const PUBKEY_LEN: usize = 32;

/// Errors produced while parsing watched addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Entry is not in `name|address` form: {0}")]
    MalformedEntry(String),
    #[error("Invalid base58 public key: {0}")]
    InvalidPublicKey(String),
}

/// Returns true if `key` decodes from base58 to exactly 32 bytes.
pub fn is_valid_pubkey(key: &str) -> bool {
    matches!(bs58::decode(key).into_vec(), Ok(bytes) if bytes.len() == PUBKEY_LEN)
}

/// Encode a raw 32-byte key as base58.
pub fn encode_pubkey(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// A wallet being watched, with its human-readable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchedAddress {
    /// Display name used in alerts (e.g. the trader's nickname)
    pub display_name: CompactString,
    /// Base58-encoded public key
    pub public_key: String,
}

impl WatchedAddress {
    /// Create a watched address after validating the key.
    pub fn new(display_name: &str, public_key: &str) -> Result<Self, AddressError> {
        let public_key = public_key.trim();
        if !is_valid_pubkey(public_key) {
            return Err(AddressError::InvalidPublicKey(public_key.to_string()));
        }
        Ok(Self {
            display_name: CompactString::new(display_name.trim()),
            public_key: public_key.to_string(),
        })
    }

    /// Parse a single `name|address` entry.
    pub fn parse(entry: &str) -> Result<Self, AddressError> {
        let (name, key) = entry
            .split_once('|')
            .ok_or_else(|| AddressError::MalformedEntry(entry.to_string()))?;
        if key.trim().is_empty() {
            return Err(AddressError::MalformedEntry(entry.to_string()));
        }
        Self::new(name, key)
    }
}

/// Immutable lookup table from public key to watched address.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    entries: Vec<WatchedAddress>,
    index: HashMap<String, usize>,
}

impl AddressBook {
    /// Build an address book. Later duplicates of the same key are ignored.
    pub fn new(addresses: impl IntoIterator<Item = WatchedAddress>) -> Self {
        let mut entries = Vec::new();
        let mut index = HashMap::new();
        for address in addresses {
            if index.contains_key(&address.public_key) {
                continue;
            }
            index.insert(address.public_key.clone(), entries.len());
            entries.push(address);
        }
        Self { entries, index }
    }

    /// Parse a comma-separated `name|address` list.
    ///
    /// Returns the book built from valid entries plus the rejected entries
    /// so the caller can report them.
    pub fn parse_list(raw: &str) -> (Self, Vec<AddressError>) {
        let mut valid = Vec::new();
        let mut rejected = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match WatchedAddress::parse(entry) {
                Ok(address) => valid.push(address),
                Err(e) => rejected.push(e),
            }
        }
        (Self::new(valid), rejected)
    }

    /// Look up a watched address by public key.
    pub fn get(&self, public_key: &str) -> Option<&WatchedAddress> {
        self.index.get(public_key).map(|&i| &self.entries[i])
    }

    /// Display name for a public key, if watched.
    pub fn display_name(&self, public_key: &str) -> Option<&str> {
        self.get(public_key).map(|a| a.display_name.as_str())
    }

    #[inline]
    pub fn contains(&self, public_key: &str) -> bool {
        self.index.contains_key(public_key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate addresses in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &WatchedAddress> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEY_A: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
    const KEY_B: &str = "HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH";

    #[test]
    fn test_parse_entry() {
        let address = WatchedAddress::parse(" whale | 9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM ")
            .unwrap();
        assert_eq!(address.display_name.as_str(), "whale");
        assert_eq!(address.public_key, KEY_A);
    }

    #[test]
    fn test_parse_entry_rejects_missing_separator() {
        assert!(matches!(
            WatchedAddress::parse(KEY_A),
            Err(AddressError::MalformedEntry(_))
        ));
        assert!(matches!(
            WatchedAddress::parse("whale|"),
            Err(AddressError::MalformedEntry(_))
        ));
    }

    #[test]
    fn test_parse_entry_rejects_bad_key() {
        assert!(matches!(
            WatchedAddress::parse("whale|not-a-key"),
            Err(AddressError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_parse_list_keeps_valid_entries() {
        let raw = format!("alice|{KEY_A},broken,bob|{KEY_B},,");
        let (book, rejected) = AddressBook::parse_list(&raw);

        assert_eq!(book.len(), 2);
        assert_eq!(rejected.len(), 1);
        assert_eq!(book.display_name(KEY_B), Some("bob"));
        assert!(book.contains(KEY_A));
        assert!(!book.contains("unknown"));
    }

    #[test]
    fn test_duplicate_keys_keep_first_name() {
        let book = AddressBook::new(vec![
            WatchedAddress::new("first", KEY_A).unwrap(),
            WatchedAddress::new("second", KEY_A).unwrap(),
        ]);
        assert_eq!(book.len(), 1);
        assert_eq!(book.display_name(KEY_A), Some("first"));
    }

    #[test]
    fn test_encode_pubkey() {
        let bytes = bs58::decode(KEY_A).into_vec().unwrap();
        assert_eq!(encode_pubkey(&bytes), KEY_A);
        assert!(is_valid_pubkey(KEY_A));
        assert!(!is_valid_pubkey("abc"));
    }
}
