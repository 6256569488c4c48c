//! Swap classification.
//!
//! A transaction is a trade when one of an ordered list of detection rules
//! matches and its balance deltas name one reserve asset (source) and one
//! non-reserve asset (target). Rules run in order and the first match wins:
//!
//! 1. `ProgramId` - an instruction invokes an allow-listed DEX or router
//! 2. `BalancePair` - one asset went down and another went up
//! 3. `InstructionKeyword` - instruction payload text contains a keyword
//! 4. `AccountPattern` - a resolved account key contains a pool-like substring
//!
//! Rules 2-4 are heuristics. Their keyword lists are configurable.

use crate::ResolvedAccountList;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use kolwatch_core::{AddressBook, BalanceDeltas, Operation, TradeEvent, Venue, WatchedAddress};
use kolwatch_feeds::{CompiledInstruction, ObservedTransaction};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Known swap and router programs: (program id, display name).
pub const DEFAULT_DEX_PROGRAMS: &[(&str, &str)] = &[
    ("JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4", "Jupiter"),
    ("JUP4Fb2cqiRUcaTHdrPC8h2gNsA2ETXiPDD33WcGuJB", "Jupiter v4"),
    ("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", "Raydium AMM"),
    ("CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK", "Raydium CLMM"),
    ("CPMMoo8L3F4NbTegBCKVNunggL7H1ZpdTHKxQB5qKP1C", "Raydium CPMM"),
    ("whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc", "Orca Whirlpool"),
    ("LBUZKhRxPF3XUpBCjp4YzTKgLccjZhTSDM9YuVaPwxo", "Meteora DLMM"),
    ("Eo7WjKq67rjJQSZxS6z3YkapzY3eMj6Xy8X5EQVn5UaB", "Meteora Pools"),
    ("6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P", "Pump.fun"),
    ("pAMMBay6oceH9fJKBRHGP5D4bD4sWpmSwMn52FMfXEA", "PumpSwap"),
];

/// Default instruction payload keywords.
pub const DEFAULT_INSTRUCTION_KEYWORDS: &[&str] = &["swap", "route", "fill"];

/// Default account key substrings.
pub const DEFAULT_ACCOUNT_PATTERNS: &[&str] = &["pool", "liquidity", "vault"];

/// One detection pass.
#[derive(Debug, Clone)]
pub enum DetectionRule {
    /// Program id -> display name
    ProgramId(HashMap<String, CompactString>),
    BalancePair,
    /// Lower-case keywords searched in instruction payloads
    InstructionKeyword(Vec<String>),
    /// Lower-case substrings searched in resolved account keys
    AccountPattern(Vec<String>),
}

impl DetectionRule {
    pub fn default_programs() -> Self {
        Self::programs(DEFAULT_DEX_PROGRAMS.iter().copied())
    }

    pub fn programs<'a>(programs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        DetectionRule::ProgramId(
            programs
                .into_iter()
                .map(|(id, name)| (id.to_string(), CompactString::new(name)))
                .collect(),
        )
    }

    pub fn keywords<S: AsRef<str>>(keywords: impl IntoIterator<Item = S>) -> Self {
        DetectionRule::InstructionKeyword(lowercase_all(keywords))
    }

    pub fn account_patterns<S: AsRef<str>>(patterns: impl IntoIterator<Item = S>) -> Self {
        DetectionRule::AccountPattern(lowercase_all(patterns))
    }

    /// The default ordered rule list.
    pub fn default_rules() -> Vec<DetectionRule> {
        vec![
            Self::default_programs(),
            DetectionRule::BalancePair,
            Self::keywords(DEFAULT_INSTRUCTION_KEYWORDS.iter()),
            Self::account_patterns(DEFAULT_ACCOUNT_PATTERNS.iter()),
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            DetectionRule::ProgramId(_) => "program_id",
            DetectionRule::BalancePair => "balance_pair",
            DetectionRule::InstructionKeyword(_) => "instruction_keyword",
            DetectionRule::AccountPattern(_) => "account_pattern",
        }
    }

    fn evaluate(&self, input: &ClassificationInput<'_>) -> Option<Venue> {
        match self {
            DetectionRule::ProgramId(programs) => input
                .instructions()
                .filter_map(|ix| input.accounts.get(ix.program_id_index as usize))
                .find_map(|program| programs.get(program))
                .map(|name| Venue::KnownDex(name.clone())),
            DetectionRule::BalancePair => {
                let down = input.deltas.iter().any(|d| d.is_decrease());
                let up = input.deltas.iter().any(|d| d.is_increase());
                (down && up).then_some(Venue::HeuristicMatch)
            }
            DetectionRule::InstructionKeyword(keywords) => input
                .instructions()
                .any(|ix| {
                    let text = String::from_utf8_lossy(&ix.data_bytes()).to_lowercase();
                    keywords.iter().any(|k| text.contains(k.as_str()))
                })
                .then_some(Venue::HeuristicMatch),
            DetectionRule::AccountPattern(patterns) => input
                .accounts
                .iter()
                .any(|key| {
                    let key = key.to_lowercase();
                    patterns.iter().any(|p| key.contains(p.as_str()))
                })
                .then_some(Venue::HeuristicMatch),
        }
    }
}

fn lowercase_all<S: AsRef<str>>(items: impl IntoIterator<Item = S>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.as_ref().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

struct ClassificationInput<'a> {
    tx: &'a ObservedTransaction,
    accounts: &'a ResolvedAccountList,
    deltas: &'a BalanceDeltas,
}

impl ClassificationInput<'_> {
    /// Top-level instructions, then inner instructions.
    fn instructions(&self) -> impl Iterator<Item = &CompiledInstruction> {
        self.tx
            .instructions
            .iter()
            .chain(self.tx.inner_instructions.iter())
    }
}

/// Why a transaction was not classified as a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    UnwatchedSigner,
    FailedTransaction,
    NoDetectionRule,
    MissingSourceAsset,
    MissingTargetAsset,
    SameAsset,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::UnwatchedSigner => "signer not watched",
            RejectReason::FailedTransaction => "transaction failed",
            RejectReason::NoDetectionRule => "no detection rule matched",
            RejectReason::MissingSourceAsset => "no reserve asset moved",
            RejectReason::MissingTargetAsset => "no non-reserve asset moved",
            RejectReason::SameAsset => "source and target are the same asset",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Trade(TradeEvent),
    Rejected(RejectReason),
}

impl Classification {
    pub fn trade(&self) -> Option<&TradeEvent> {
        match self {
            Classification::Trade(event) => Some(event),
            Classification::Rejected(_) => None,
        }
    }

    pub fn into_trade(self) -> Option<TradeEvent> {
        match self {
            Classification::Trade(event) => Some(event),
            Classification::Rejected(_) => None,
        }
    }
}

/// Evaluation counters of one rule.
#[derive(Debug, Default)]
struct RuleCounters {
    evaluated: AtomicU64,
    matched: AtomicU64,
}

/// Point-in-time counters of one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleStats {
    pub rule: &'static str,
    pub evaluated: u64,
    pub matched: u64,
}

/// Classifies transactions of watched signers as trades.
pub struct SwapClassifier {
    address_book: Arc<AddressBook>,
    rules: Vec<(DetectionRule, RuleCounters)>,
    classified: AtomicU64,
    rejected: AtomicU64,
}

impl SwapClassifier {
    /// Classifier with the default rule list.
    pub fn new(address_book: Arc<AddressBook>) -> Self {
        Self::with_rules(address_book, DetectionRule::default_rules())
    }

    pub fn with_rules(address_book: Arc<AddressBook>, rules: Vec<DetectionRule>) -> Self {
        Self {
            address_book,
            rules: rules
                .into_iter()
                .map(|rule| (rule, RuleCounters::default()))
                .collect(),
            classified: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    pub fn classify(
        &self,
        tx: &ObservedTransaction,
        accounts: &ResolvedAccountList,
        deltas: &BalanceDeltas,
    ) -> Classification {
        let outcome = self.classify_inner(tx, accounts, deltas);
        match &outcome {
            Classification::Trade(event) => {
                self.classified.fetch_add(1, Ordering::Relaxed);
                debug!(
                    signature = %tx.signature,
                    operation = %event.operation,
                    venue = %event.venue,
                    "Transaction classified as trade"
                );
            }
            Classification::Rejected(reason) => self.record_rejection(tx, *reason),
        }
        outcome
    }

    /// Rejections decidable from the transaction alone.
    ///
    /// Callers run this before resolving lookup tables so transactions
    /// that merely mention a watched wallet cost no further RPC calls.
    pub fn screen(&self, tx: &ObservedTransaction) -> Option<RejectReason> {
        let reason = self.precheck(tx).err()?;
        self.record_rejection(tx, reason);
        Some(reason)
    }

    fn record_rejection(&self, tx: &ObservedTransaction, reason: RejectReason) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(signature = %tx.signature, reason = %reason, "Transaction rejected");
    }

    fn precheck(&self, tx: &ObservedTransaction) -> Result<&WatchedAddress, RejectReason> {
        let watched = tx
            .signer()
            .and_then(|s| self.address_book.get(s))
            .ok_or(RejectReason::UnwatchedSigner)?;
        if tx.failed {
            return Err(RejectReason::FailedTransaction);
        }
        Ok(watched)
    }

    fn classify_inner(
        &self,
        tx: &ObservedTransaction,
        accounts: &ResolvedAccountList,
        deltas: &BalanceDeltas,
    ) -> Classification {
        let watched = match self.precheck(tx) {
            Ok(watched) => watched,
            Err(reason) => return Classification::Rejected(reason),
        };

        let input = ClassificationInput {
            tx,
            accounts,
            deltas,
        };
        let Some(venue) = self.detect(&input) else {
            return Classification::Rejected(RejectReason::NoDetectionRule);
        };

        let Some(source) = deltas.iter().find(|d| d.is_reserve()) else {
            return Classification::Rejected(RejectReason::MissingSourceAsset);
        };
        let Some(target) = deltas
            .iter()
            .find(|d| !d.is_reserve() && !d.change.is_zero())
        else {
            return Classification::Rejected(RejectReason::MissingTargetAsset);
        };
        if source.asset == target.asset {
            return Classification::Rejected(RejectReason::SameAsset);
        }

        Classification::Trade(TradeEvent {
            signer: watched.public_key.clone(),
            signer_name: watched.display_name.clone(),
            signature: tx.signature.clone(),
            source_asset: source.asset.clone(),
            source_change: source.change,
            target_asset: target.asset.clone(),
            target_change: target.change,
            sol_change: deltas.native_change(),
            operation: Operation::from_target_change(target.change),
            venue,
            fee_lamports: tx.fee,
            timestamp: tx
                .block_time
                .and_then(|t| DateTime::from_timestamp(t, 0))
                .unwrap_or_else(Utc::now),
        })
    }

    /// Run the rules in order and stop at the first match.
    fn detect(&self, input: &ClassificationInput<'_>) -> Option<Venue> {
        for (rule, counters) in &self.rules {
            counters.evaluated.fetch_add(1, Ordering::Relaxed);
            if let Some(venue) = rule.evaluate(input) {
                counters.matched.fetch_add(1, Ordering::Relaxed);
                return Some(venue);
            }
        }
        None
    }

    /// Per-rule counters, in rule order.
    pub fn rule_stats(&self) -> Vec<RuleStats> {
        self.rules
            .iter()
            .map(|(rule, counters)| RuleStats {
                rule: rule.name(),
                evaluated: counters.evaluated.load(Ordering::Relaxed),
                matched: counters.matched.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn classified_count(&self) -> u64 {
        self.classified.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
