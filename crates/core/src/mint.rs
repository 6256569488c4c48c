//! Asset (mint) identifiers and well-known mints.

use compact_str::CompactString;
use rust_decimal::Decimal;

/// Identifier of a fungible asset (the token mint address).
pub type MintId = CompactString;

/// Reserved id for the native asset (SOL). Shared with the wrapped-SOL mint.
pub const NATIVE_MINT: &str = "So11111111111111111111111111111111111111112";

/// USD Coin mint.
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

/// Tether USD mint.
pub const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";

/// Decimal places of the native asset.
pub const NATIVE_DECIMALS: u32 = 9;

/// Reserve assets in priority order: native first, then the two stablecoins.
pub const RESERVE_MINTS: [&str; 3] = [NATIVE_MINT, USDC_MINT, USDT_MINT];

/// Returns true for the native asset and the reference stablecoins.
#[inline]
pub fn is_reserve_mint(mint: &str) -> bool {
    RESERVE_MINTS.contains(&mint)
}

#[inline]
pub fn is_native_mint(mint: &str) -> bool {
    mint == NATIVE_MINT
}

/// Short symbol for a reserve mint, if it is one.
pub fn reserve_symbol(mint: &str) -> Option<&'static str> {
    match mint {
        NATIVE_MINT => Some("SOL"),
        USDC_MINT => Some("USDC"),
        USDT_MINT => Some("USDT"),
        _ => None,
    }
}

/// Convert a lamport amount to SOL with exact decimal scale.
pub fn lamports_to_sol(lamports: u64) -> Decimal {
    Decimal::from_i128_with_scale(lamports as i128, NATIVE_DECIMALS)
}

/// The native asset id as a `MintId`.
pub fn native_mint() -> MintId {
    MintId::const_new(NATIVE_MINT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn test_lamports_to_sol() {
        assert_eq!(lamports_to_sol(1_500_000_000), Decimal::from_str("1.5").unwrap());
        assert_eq!(lamports_to_sol(1), Decimal::from_str("0.000000001").unwrap());
        assert_eq!(lamports_to_sol(0), Decimal::ZERO);
    }

    #[test]
    fn test_reserve_mints() {
        assert!(is_reserve_mint(NATIVE_MINT));
        assert!(is_reserve_mint(USDC_MINT));
        assert!(is_reserve_mint(USDT_MINT));
        assert!(!is_reserve_mint("JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN"));
        assert_eq!(reserve_symbol(USDC_MINT), Some("USDC"));
        assert_eq!(reserve_symbol("other"), None);
    }
}
