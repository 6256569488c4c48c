//! Per-asset balance deltas of a transaction's signer.

use kolwatch_core::{
    is_native_mint, lamports_to_sol, native_mint, BalanceDelta, BalanceDeltas, BalanceSnapshot,
    MintId,
};
use kolwatch_feeds::{ObservedTransaction, TokenBalance};
use rust_decimal::Decimal;

/// Computes asset → (pre, post, change) for one owner.
///
/// Rules, in order:
/// 1. The native entry comes from the signer's lamports and is always present
///    before pruning.
/// 2. Each asset in the pre snapshot owned by the signer seeds an entry with
///    `post = pre`.
/// 3. Each asset in the post snapshot owned by the signer sets `post` on its
///    entry, or creates one with `pre = 0`.
/// 4. Entries whose change is zero are dropped.
///
/// Several token accounts of one mint are summed per snapshot. Wrapped SOL
/// records are folded into the native entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceDeltaAnalyzer;

impl BalanceDeltaAnalyzer {
    pub fn compute_deltas(
        signer: &str,
        pre_balances: &[BalanceSnapshot],
        post_balances: &[BalanceSnapshot],
        native_pre_lamports: u64,
        native_post_lamports: u64,
    ) -> BalanceDeltas {
        let pre = sum_by_asset(signer, pre_balances, |s| s.pre_amount);
        let post = sum_by_asset(signer, post_balances, |s| s.post_amount);

        let mut deltas = BalanceDeltas::new();
        deltas.insert(BalanceDelta::new(
            native_mint(),
            lamports_to_sol(native_pre_lamports),
            lamports_to_sol(native_post_lamports),
        ));

        for (asset, amount) in &pre {
            match deltas.get_mut(asset) {
                // Wrapped SOL counts on both sides of the native entry
                Some(existing) => {
                    existing.pre += *amount;
                    existing.set_post(existing.post + *amount);
                }
                None => deltas.insert(BalanceDelta::new(asset.clone(), *amount, *amount)),
            }
        }

        for (asset, amount) in &post {
            if is_native_mint(asset) {
                // Undo the seeded wrapped-SOL post and apply the real one
                let seeded = lookup(&pre, asset).unwrap_or(Decimal::ZERO);
                if let Some(native) = deltas.get_mut(asset) {
                    native.set_post(native.post - seeded + *amount);
                }
                continue;
            }
            match deltas.get_mut(asset) {
                Some(existing) => existing.set_post(*amount),
                None => deltas.insert(BalanceDelta::new(asset.clone(), Decimal::ZERO, *amount)),
            }
        }

        deltas.prune_unchanged();
        deltas
    }

    /// Deltas of the transaction's signer (fee payer).
    pub fn from_transaction(tx: &ObservedTransaction) -> BalanceDeltas {
        let Some(signer) = tx.signer() else {
            return BalanceDeltas::new();
        };
        let (native_pre, native_post) = tx.lamports_at(0).unwrap_or((0, 0));
        let (pre, post) = snapshots_from_transaction(tx);
        Self::compute_deltas(signer, &pre, &post, native_pre, native_post)
    }
}

/// Convert a transaction's token balance records into snapshots.
pub fn snapshots_from_transaction(
    tx: &ObservedTransaction,
) -> (Vec<BalanceSnapshot>, Vec<BalanceSnapshot>) {
    let convert = |balances: &[TokenBalance], is_pre: bool| -> Vec<BalanceSnapshot> {
        balances
            .iter()
            .map(|b| BalanceSnapshot {
                asset: MintId::new(&b.mint),
                owner: b.owner.clone().unwrap_or_default(),
                pre_amount: if is_pre { b.amount } else { None },
                post_amount: if is_pre { None } else { b.amount },
            })
            .collect()
    };
    (
        convert(&tx.pre_token_balances, true),
        convert(&tx.post_token_balances, false),
    )
}

/// Sum the signer's amounts per asset, keeping first-seen order.
/// Records without an amount are skipped.
fn sum_by_asset(
    signer: &str,
    snapshots: &[BalanceSnapshot],
    amount: impl Fn(&BalanceSnapshot) -> Option<Decimal>,
) -> Vec<(MintId, Decimal)> {
    let mut sums: Vec<(MintId, Decimal)> = Vec::new();
    for snapshot in snapshots.iter().filter(|s| s.owner == signer) {
        let Some(value) = amount(snapshot) else {
            continue;
        };
        match sums.iter_mut().find(|(asset, _)| *asset == snapshot.asset) {
            Some((_, total)) => *total += value,
            None => sums.push((snapshot.asset.clone(), value)),
        }
    }
    sums
}

fn lookup(sums: &[(MintId, Decimal)], asset: &str) -> Option<Decimal> {
    sums.iter().find(|(a, _)| a.as_str() == asset).map(|(_, v)| *v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kolwatch_core::{NATIVE_MINT, USDC_MINT};
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    const SIGNER: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
    const OTHER: &str = "HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH";
    const MEME: &str = "MemeMint1111111111111111111111111111111111";

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_change_is_post_minus_pre() {
        let deltas = BalanceDeltaAnalyzer::compute_deltas(
            SIGNER,
            &[BalanceSnapshot::pre(USDC_MINT, SIGNER, dec("250.5"))],
            &[BalanceSnapshot::post(USDC_MINT, SIGNER, dec("100.25"))],
            0,
            0,
        );

        let usdc = deltas.get(USDC_MINT).unwrap();
        assert_eq!(usdc.pre, dec("250.5"));
        assert_eq!(usdc.post, dec("100.25"));
        assert_eq!(usdc.change, usdc.post - usdc.pre);
    }

    #[test]
    fn test_post_only_asset_starts_from_zero() {
        let deltas = BalanceDeltaAnalyzer::compute_deltas(
            SIGNER,
            &[],
            &[BalanceSnapshot::post(MEME, SIGNER, dec("1000"))],
            0,
            0,
        );

        let meme = deltas.get(MEME).unwrap();
        assert_eq!(meme.pre, Decimal::ZERO);
        assert_eq!(meme.change, dec("1000"));
    }

    #[test]
    fn test_native_from_lamports_and_unchanged_pruned() {
        let deltas = BalanceDeltaAnalyzer::compute_deltas(
            SIGNER,
            &[BalanceSnapshot::pre(USDC_MINT, SIGNER, dec("5"))],
            &[BalanceSnapshot::post(USDC_MINT, SIGNER, dec("5"))],
            2_000_000_000,
            1_500_000_000,
        );

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas.native_change(), dec("-0.5"));
        assert!(deltas.get(USDC_MINT).is_none());
    }

    #[test]
    fn test_pre_only_asset_keeps_pre_as_post() {
        let deltas = BalanceDeltaAnalyzer::compute_deltas(
            SIGNER,
            &[BalanceSnapshot::pre(MEME, SIGNER, dec("42"))],
            &[],
            0,
            0,
        );
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_other_owners_ignored() {
        let deltas = BalanceDeltaAnalyzer::compute_deltas(
            SIGNER,
            &[BalanceSnapshot::pre(MEME, OTHER, dec("10"))],
            &[BalanceSnapshot::post(MEME, OTHER, dec("0"))],
            0,
            0,
        );
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_token_accounts_of_one_mint_are_summed() {
        let deltas = BalanceDeltaAnalyzer::compute_deltas(
            SIGNER,
            &[
                BalanceSnapshot::pre(MEME, SIGNER, dec("10")),
                BalanceSnapshot::pre(MEME, SIGNER, dec("5")),
            ],
            &[
                BalanceSnapshot::post(MEME, SIGNER, dec("20")),
                BalanceSnapshot::post(MEME, SIGNER, dec("1")),
            ],
            0,
            0,
        );

        let meme = deltas.get(MEME).unwrap();
        assert_eq!(meme.pre, dec("15"));
        assert_eq!(meme.post, dec("21"));
        assert_eq!(meme.change, dec("6"));
    }

    #[test]
    fn test_wrapped_sol_folds_into_native() {
        // 1 SOL native spent on fees/rent, 0.5 wrapped SOL spent in the swap
        let deltas = BalanceDeltaAnalyzer::compute_deltas(
            SIGNER,
            &[BalanceSnapshot::pre(NATIVE_MINT, SIGNER, dec("0.5"))],
            &[BalanceSnapshot::post(NATIVE_MINT, SIGNER, dec("0"))],
            3_000_000_000,
            2_000_000_000,
        );

        assert_eq!(deltas.len(), 1);
        let native = deltas.get(NATIVE_MINT).unwrap();
        assert_eq!(native.pre, dec("3.5"));
        assert_eq!(native.post, dec("2"));
        assert_eq!(native.change, dec("-1.5"));
    }

    #[test]
    fn test_output_order_native_first_then_first_seen() {
        let deltas = BalanceDeltaAnalyzer::compute_deltas(
            SIGNER,
            &[BalanceSnapshot::pre(USDC_MINT, SIGNER, dec("100"))],
            &[
                BalanceSnapshot::post(MEME, SIGNER, dec("7")),
                BalanceSnapshot::post(USDC_MINT, SIGNER, dec("0")),
            ],
            10,
            5,
        );

        let order: Vec<&str> = deltas.iter().map(|d| d.asset.as_str()).collect();
        assert_eq!(order, vec![NATIVE_MINT, USDC_MINT, MEME]);
    }

    #[test]
    fn test_from_transaction() {
        let tx = ObservedTransaction {
            signature: "sig".to_string(),
            static_keys: vec![SIGNER.to_string(), OTHER.to_string()],
            pre_lamports: vec![2_000_000_000, 0],
            post_lamports: vec![1_499_995_000, 0],
            post_token_balances: vec![TokenBalance {
                account_index: 1,
                mint: MEME.to_string(),
                owner: Some(SIGNER.to_string()),
                amount: Some(dec("1000")),
            }],
            ..Default::default()
        };

        let deltas = BalanceDeltaAnalyzer::from_transaction(&tx);

        assert_eq!(deltas.native_change(), dec("-0.500005"));
        assert_eq!(deltas.get(MEME).unwrap().change, dec("1000"));
    }
}
