//! Balance snapshots and per-asset deltas.

use crate::mint::{is_native_mint, is_reserve_mint, MintId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One owner's balance of one asset as seen in a transaction's snapshots.
///
/// `None` means the snapshot carried no balance record for the asset,
/// which is distinct from a recorded zero balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub asset: MintId,
    pub owner: String,
    pub pre_amount: Option<Decimal>,
    pub post_amount: Option<Decimal>,
}

impl BalanceSnapshot {
    /// Record from a pre-transaction snapshot.
    pub fn pre(asset: &str, owner: &str, amount: Decimal) -> Self {
        Self {
            asset: MintId::new(asset),
            owner: owner.to_string(),
            pre_amount: Some(amount),
            post_amount: None,
        }
    }

    /// Record from a post-transaction snapshot.
    pub fn post(asset: &str, owner: &str, amount: Decimal) -> Self {
        Self {
            asset: MintId::new(asset),
            owner: owner.to_string(),
            pre_amount: None,
            post_amount: Some(amount),
        }
    }
}

/// Balance change of one asset across a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub asset: MintId,
    pub pre: Decimal,
    pub post: Decimal,
    /// `post - pre`
    pub change: Decimal,
}

impl BalanceDelta {
    pub fn new(asset: MintId, pre: Decimal, post: Decimal) -> Self {
        Self {
            asset,
            pre,
            post,
            change: post - pre,
        }
    }

    /// Replace `post` and recompute `change`.
    pub fn set_post(&mut self, post: Decimal) {
        self.post = post;
        self.change = post - self.pre;
    }

    #[inline]
    pub fn is_increase(&self) -> bool {
        self.change > Decimal::ZERO
    }

    #[inline]
    pub fn is_decrease(&self) -> bool {
        self.change < Decimal::ZERO
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        is_native_mint(&self.asset)
    }

    #[inline]
    pub fn is_reserve(&self) -> bool {
        is_reserve_mint(&self.asset)
    }
}

/// Ordered asset → delta mapping.
///
/// Insertion order is preserved so "first matching asset" selections
/// are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDeltas {
    entries: Vec<BalanceDelta>,
}

impl BalanceDeltas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, asset: &str) -> Option<&BalanceDelta> {
        self.entries.iter().find(|d| d.asset == asset)
    }

    pub fn get_mut(&mut self, asset: &str) -> Option<&mut BalanceDelta> {
        self.entries.iter_mut().find(|d| d.asset == asset)
    }

    /// Insert a delta, replacing any existing entry for the same asset in place.
    pub fn insert(&mut self, delta: BalanceDelta) {
        match self.get_mut(&delta.asset) {
            Some(existing) => *existing = delta,
            None => self.entries.push(delta),
        }
    }

    /// Drop entries whose change is zero.
    pub fn prune_unchanged(&mut self) {
        self.entries.retain(|d| !d.change.is_zero());
    }

    pub fn iter(&self) -> impl Iterator<Item = &BalanceDelta> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Change of the native asset, zero if it did not move.
    pub fn native_change(&self) -> Decimal {
        self.entries
            .iter()
            .find(|d| d.is_native())
            .map(|d| d.change)
            .unwrap_or(Decimal::ZERO)
    }
}

impl FromIterator<BalanceDelta> for BalanceDeltas {
    fn from_iter<I: IntoIterator<Item = BalanceDelta>>(iter: I) -> Self {
        let mut deltas = Self::new();
        for delta in iter {
            deltas.insert(delta);
        }
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mint::{NATIVE_MINT, USDC_MINT};
    use pretty_assertions::assert_eq;

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    #[test]
    fn test_delta_change() {
        let mut delta = BalanceDelta::new(MintId::new("mint"), dec(10), dec(4));
        assert_eq!(delta.change, dec(-6));
        assert!(delta.is_decrease());

        delta.set_post(dec(25));
        assert_eq!(delta.change, dec(15));
        assert!(delta.is_increase());
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut deltas = BalanceDeltas::new();
        deltas.insert(BalanceDelta::new(MintId::new(NATIVE_MINT), dec(1), dec(2)));
        deltas.insert(BalanceDelta::new(MintId::new(USDC_MINT), dec(0), dec(5)));
        deltas.insert(BalanceDelta::new(MintId::new(NATIVE_MINT), dec(1), dec(3)));

        let order: Vec<&str> = deltas.iter().map(|d| d.asset.as_str()).collect();
        assert_eq!(order, vec![NATIVE_MINT, USDC_MINT]);
        assert_eq!(deltas.native_change(), dec(2));
    }

    #[test]
    fn test_prune_unchanged() {
        let mut deltas: BalanceDeltas = vec![
            BalanceDelta::new(MintId::new("a"), dec(3), dec(3)),
            BalanceDelta::new(MintId::new("b"), dec(3), dec(1)),
        ]
        .into_iter()
        .collect();
        deltas.prune_unchanged();

        assert_eq!(deltas.len(), 1);
        assert!(deltas.get("a").is_none());
        assert_eq!(deltas.native_change(), Decimal::ZERO);
    }
}
