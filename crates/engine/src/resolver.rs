//! Address-table lookup resolution.
//!
//! A versioned transaction lists only its static account keys inline;
//! the rest are indexes into on-chain lookup tables. `AccountResolver`
//! fetches each table once and expands the indexes into keys, writable
//! indexes first and readonly second, in lookup order.

use kolwatch_core::{encode_pubkey, PUBKEY_LEN};
use kolwatch_feeds::{AddressTableLookup, ChainRpc, ObservedTransaction};
use std::sync::Arc;
use tracing::{debug, warn};

/// Size of the metadata header of an on-chain address lookup table account.
pub const LOOKUP_TABLE_META_SIZE: usize = 56;

const SENTINEL_PREFIX: &str = "invalid_index_";

/// Placeholder for a lookup index that could not be resolved.
pub fn unresolved_key(index: u8) -> String {
    format!("{SENTINEL_PREFIX}{index}")
}

pub fn is_unresolved_key(key: &str) -> bool {
    key.starts_with(SENTINEL_PREFIX)
}

/// Ordered account keys of one transaction: static keys then looked-up keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAccountList {
    keys: Vec<String>,
    static_count: usize,
}

impl ResolvedAccountList {
    /// A list holding only static keys.
    pub fn from_static(static_keys: &[String]) -> Self {
        Self {
            keys: static_keys.to_vec(),
            static_count: static_keys.len(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.keys.get(index).map(String::as_str)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn static_count(&self) -> usize {
        self.static_count
    }

    /// Keys that came from lookup tables.
    pub fn looked_up(&self) -> &[String] {
        &self.keys[self.static_count..]
    }

    /// Number of sentinel entries.
    pub fn unresolved_count(&self) -> usize {
        self.keys.iter().filter(|k| is_unresolved_key(k)).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

/// Read the key at `index` from raw table data.
///
/// Returns `None` if the 32-byte slot lies outside the buffer.
pub fn table_key_at(data: &[u8], header_offset: usize, index: u8) -> Option<String> {
    let start = header_offset.checked_add(index as usize * PUBKEY_LEN)?;
    let end = start.checked_add(PUBKEY_LEN)?;
    data.get(start..end).map(encode_pubkey)
}

/// Expands address-table lookups through a [`ChainRpc`].
///
/// Resolution never fails as a whole: a table that cannot be fetched
/// turns every index of that lookup into a sentinel, and an index past
/// the end of the table turns only that key into a sentinel.
pub struct AccountResolver {
    rpc: Arc<dyn ChainRpc>,
    header_offset: usize,
}

impl AccountResolver {
    /// Resolver reading keys from offset 0 of the table data.
    pub fn new(rpc: Arc<dyn ChainRpc>) -> Self {
        Self {
            rpc,
            header_offset: 0,
        }
    }

    /// Skip `offset` bytes of table metadata before the key array.
    pub fn with_table_header(mut self, offset: usize) -> Self {
        self.header_offset = offset;
        self
    }

    pub fn header_offset(&self) -> usize {
        self.header_offset
    }

    pub async fn resolve(
        &self,
        static_keys: &[String],
        lookups: &[AddressTableLookup],
    ) -> ResolvedAccountList {
        let mut resolved = ResolvedAccountList::from_static(static_keys);

        for lookup in lookups {
            let indexes = lookup
                .writable_indexes
                .iter()
                .chain(lookup.readonly_indexes.iter())
                .copied();

            let data = match self.rpc.get_account_info(&lookup.table_key).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    warn!(table = %lookup.table_key, "Lookup table account not found");
                    resolved.keys.extend(indexes.map(unresolved_key));
                    continue;
                }
                Err(e) => {
                    warn!(table = %lookup.table_key, error = %e, "Failed to fetch lookup table");
                    resolved.keys.extend(indexes.map(unresolved_key));
                    continue;
                }
            };

            for index in indexes {
                match table_key_at(&data, self.header_offset, index) {
                    Some(key) => resolved.keys.push(key),
                    None => {
                        warn!(
                            table = %lookup.table_key,
                            index,
                            len = data.len(),
                            "Lookup index out of range"
                        );
                        resolved.keys.push(unresolved_key(index));
                    }
                }
            }
        }

        debug!(
            static_keys = resolved.static_count,
            total = resolved.len(),
            unresolved = resolved.unresolved_count(),
            "Resolved account keys"
        );
        resolved
    }

    /// Resolve the full account list of a fetched transaction.
    pub async fn resolve_transaction(&self, tx: &ObservedTransaction) -> ResolvedAccountList {
        self.resolve(&tx.static_keys, &tx.address_table_lookups).await
    }
}
