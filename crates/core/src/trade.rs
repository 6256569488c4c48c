//! Classified trade events.

use crate::mint::MintId;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a trade from the watched wallet's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Wallet acquired the target asset
    Buy,
    /// Wallet divested the target asset
    Sell,
}

impl Operation {
    /// Derive the operation from the target asset's balance change.
    pub fn from_target_change(change: Decimal) -> Self {
        if change > Decimal::ZERO {
            Operation::Buy
        } else {
            Operation::Sell
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Buy => "Buy",
            Operation::Sell => "Sell",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detected execution path of a trade.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    /// A named, allow-listed swap or router program
    KnownDex(CompactString),
    /// Matched by a heuristic rule rather than a known program
    HeuristicMatch,
    None,
}

impl Venue {
    pub fn known(name: &str) -> Self {
        Venue::KnownDex(CompactString::new(name))
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Venue::KnownDex(_))
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::KnownDex(name) => f.write_str(name),
            Venue::HeuristicMatch => f.write_str("Unknown DEX (heuristic)"),
            Venue::None => f.write_str("None"),
        }
    }
}

/// A transaction classified as a trade by a watched wallet.
///
/// Built once per transaction and consumed once by the notification router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Signing wallet (base58)
    pub signer: String,
    /// Display name of the signer from the address book
    pub signer_name: CompactString,
    /// Transaction signature
    pub signature: String,
    /// Reserve asset paid or received (SOL, USDC, USDT)
    pub source_asset: MintId,
    pub source_change: Decimal,
    /// Non-reserve asset that was traded
    pub target_asset: MintId,
    pub target_change: Decimal,
    /// Native balance change including fees
    pub sol_change: Decimal,
    pub operation: Operation,
    pub venue: Venue,
    /// Network fee in lamports
    pub fee_lamports: u64,
    pub timestamp: DateTime<Utc>,
}
