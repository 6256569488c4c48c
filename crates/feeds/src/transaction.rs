//! Transaction model decoded from `getTransaction` responses.
//!
//! Transactions are requested with JSON encoding so the message carries
//! only its static account keys plus raw address-table lookups. Resolving
//! the lookups is left to the caller.

use crate::RpcError;
use rust_decimal::Decimal;
use solana_transaction_status::option_serializer::OptionSerializer;
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, EncodedTransaction, UiCompiledInstruction,
    UiInstruction, UiMessage, UiTransactionStatusMeta, UiTransactionTokenBalance,
};
use std::str::FromStr;

/// One address-table lookup of a versioned transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTableLookup {
    /// Address of the lookup-table account
    pub table_key: String,
    pub writable_indexes: Vec<u8>,
    pub readonly_indexes: Vec<u8>,
}

/// An instruction referencing accounts by index into the resolved key list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledInstruction {
    pub program_id_index: u8,
    pub accounts: Vec<u8>,
    /// Base58-encoded instruction payload
    pub data: String,
}

impl CompiledInstruction {
    /// Decoded payload bytes. Falls back to the raw text if it is not base58.
    pub fn data_bytes(&self) -> Vec<u8> {
        bs58::decode(&self.data)
            .into_vec()
            .unwrap_or_else(|_| self.data.as_bytes().to_vec())
    }
}

/// A token balance record from `preTokenBalances` / `postTokenBalances`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBalance {
    pub account_index: u32,
    pub mint: String,
    pub owner: Option<String>,
    /// UI amount (raw amount scaled by decimals). `None` if the node sent no amount.
    pub amount: Option<Decimal>,
}

/// A confirmed transaction as observed on chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObservedTransaction {
    pub signature: String,
    pub slot: u64,
    pub block_time: Option<i64>,
    /// True if the transaction executed with an error
    pub failed: bool,
    pub fee: u64,
    pub static_keys: Vec<String>,
    pub address_table_lookups: Vec<AddressTableLookup>,
    pub instructions: Vec<CompiledInstruction>,
    /// Inner (CPI) instructions flattened in execution order
    pub inner_instructions: Vec<CompiledInstruction>,
    pub pre_lamports: Vec<u64>,
    pub post_lamports: Vec<u64>,
    pub pre_token_balances: Vec<TokenBalance>,
    pub post_token_balances: Vec<TokenBalance>,
}

impl ObservedTransaction {
    /// Fee payer and first signer.
    pub fn signer(&self) -> Option<&str> {
        self.static_keys.first().map(String::as_str)
    }

    /// Lamport balances of the account at `index` before and after execution.
    pub fn lamports_at(&self, index: usize) -> Option<(u64, u64)> {
        Some((*self.pre_lamports.get(index)?, *self.post_lamports.get(index)?))
    }

    /// Convert a JSON-encoded `getTransaction` result.
    pub fn from_encoded(
        signature: &str,
        encoded: EncodedConfirmedTransactionWithStatusMeta,
    ) -> Result<Self, RpcError> {
        let EncodedTransaction::Json(ui) = encoded.transaction.transaction else {
            return Err(RpcError::ParseError(
                "expected a JSON encoded transaction".to_string(),
            ));
        };
        let UiMessage::Raw(message) = ui.message else {
            return Err(RpcError::ParseError(
                "expected a raw (unparsed) message".to_string(),
            ));
        };

        let mut tx = ObservedTransaction {
            signature: signature.to_string(),
            slot: encoded.slot,
            block_time: encoded.block_time,
            static_keys: message.account_keys,
            address_table_lookups: message
                .address_table_lookups
                .unwrap_or_default()
                .into_iter()
                .map(|l| AddressTableLookup {
                    table_key: l.account_key,
                    writable_indexes: l.writable_indexes,
                    readonly_indexes: l.readonly_indexes,
                })
                .collect(),
            instructions: message.instructions.into_iter().map(Into::into).collect(),
            ..Default::default()
        };
        if let Some(meta) = encoded.transaction.meta {
            tx.apply_meta(meta);
        }
        Ok(tx)
    }

    fn apply_meta(&mut self, meta: UiTransactionStatusMeta) {
        self.failed = meta.err.is_some();
        self.fee = meta.fee;
        self.pre_lamports = meta.pre_balances;
        self.post_lamports = meta.post_balances;
        self.pre_token_balances = token_balances(meta.pre_token_balances);
        self.post_token_balances = token_balances(meta.post_token_balances);

        let inner: Option<Vec<_>> = meta.inner_instructions.into();
        self.inner_instructions = inner
            .unwrap_or_default()
            .into_iter()
            .flat_map(|group| group.instructions)
            .filter_map(|ix| match ix {
                UiInstruction::Compiled(compiled) => Some(compiled.into()),
                // Only returned for jsonParsed encoding
                UiInstruction::Parsed(_) => None,
            })
            .collect();
    }
}

fn token_balances(raw: OptionSerializer<Vec<UiTransactionTokenBalance>>) -> Vec<TokenBalance> {
    let raw: Option<Vec<_>> = raw.into();
    raw.unwrap_or_default().into_iter().map(Into::into).collect()
}

/// Exact amount from the raw integer and decimals, else the UI string.
fn token_amount(raw: &str, decimals: u8, ui_amount: &str) -> Option<Decimal> {
    raw.parse::<i128>()
        .ok()
        .and_then(|raw| Decimal::try_from_i128_with_scale(raw, decimals as u32).ok())
        .or_else(|| Decimal::from_str(ui_amount).ok())
}

impl From<UiCompiledInstruction> for CompiledInstruction {
    fn from(raw: UiCompiledInstruction) -> Self {
        Self {
            program_id_index: raw.program_id_index,
            accounts: raw.accounts,
            data: raw.data,
        }
    }
}

impl From<UiTransactionTokenBalance> for TokenBalance {
    fn from(raw: UiTransactionTokenBalance) -> Self {
        let amount = token_amount(
            &raw.ui_token_amount.amount,
            raw.ui_token_amount.decimals,
            &raw.ui_token_amount.ui_amount_string,
        );
        let owner: Option<String> = raw.owner.into();
        Self {
            account_index: raw.account_index as u32,
            mint: raw.mint,
            owner,
            amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_result() -> serde_json::Value {
        json!({
            "slot": 250_000_000u64,
            "blockTime": 1_700_000_000i64,
            "version": 0,
            "meta": {
                "err": null,
                "status": {"Ok": null},
                "fee": 5000,
                "preBalances": [2_000_000_000u64, 0, 1],
                "postBalances": [1_499_995_000u64, 0, 1],
                "innerInstructions": [{
                    "index": 0,
                    "instructions": [{"programIdIndex": 3, "accounts": [0, 1], "data": "3Bxs4h24hBtQy9rw", "stackHeight": 2}]
                }],
                "logMessages": [],
                "preTokenBalances": [],
                "postTokenBalances": [{
                    "accountIndex": 1,
                    "mint": "MintAAAA",
                    "owner": "Signer1111",
                    "programId": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
                    "uiTokenAmount": {
                        "amount": "1000000000",
                        "decimals": 6,
                        "uiAmount": 1000.0,
                        "uiAmountString": "1000"
                    }
                }],
                "rewards": [],
                "loadedAddresses": {"writable": [], "readonly": []}
            },
            "transaction": {
                "signatures": ["sig"],
                "message": {
                    "header": {
                        "numRequiredSignatures": 1,
                        "numReadonlySignedAccounts": 0,
                        "numReadonlyUnsignedAccounts": 1
                    },
                    "accountKeys": ["Signer1111", "TokenAcct", "Program2"],
                    "recentBlockhash": "EkSnNWid2cvwEVnVx9aBqawnmiCNiDgp3gUdkDPTKN1N",
                    "instructions": [{"programIdIndex": 2, "accounts": [0], "data": ""}],
                    "addressTableLookups": [{
                        "accountKey": "Table1111",
                        "writableIndexes": [0, 2],
                        "readonlyIndexes": [5]
                    }]
                }
            }
        })
    }

    fn decode(value: serde_json::Value) -> ObservedTransaction {
        let encoded: EncodedConfirmedTransactionWithStatusMeta =
            serde_json::from_value(value).unwrap();
        ObservedTransaction::from_encoded("sig", encoded).unwrap()
    }

    #[test]
    fn test_decode_transaction() {
        let tx = decode(sample_result());

        assert_eq!(tx.signer(), Some("Signer1111"));
        assert_eq!(tx.slot, 250_000_000);
        assert_eq!(tx.block_time, Some(1_700_000_000));
        assert!(!tx.failed);
        assert_eq!(tx.fee, 5000);
        assert_eq!(tx.lamports_at(0), Some((2_000_000_000, 1_499_995_000)));
        assert_eq!(tx.address_table_lookups.len(), 1);
        assert_eq!(tx.address_table_lookups[0].writable_indexes, vec![0, 2]);
        assert_eq!(tx.inner_instructions.len(), 1);
        assert_eq!(tx.inner_instructions[0].program_id_index, 3);
        assert_eq!(tx.post_token_balances[0].owner.as_deref(), Some("Signer1111"));
        assert_eq!(tx.post_token_balances[0].amount, Some(Decimal::from(1000)));
    }

    #[test]
    fn test_failed_transaction_flag() {
        let mut value = sample_result();
        value["meta"]["err"] = json!({"InstructionError": [0, {"Custom": 1}]});
        value["meta"]["status"] = json!({"Err": {"InstructionError": [0, {"Custom": 1}]}});
        assert!(decode(value).failed);
    }

    #[test]
    fn test_binary_encoding_rejected() {
        let mut value = sample_result();
        value["transaction"] = json!(["AQID", "base64"]);
        let encoded: EncodedConfirmedTransactionWithStatusMeta =
            serde_json::from_value(value).unwrap();
        let err = ObservedTransaction::from_encoded("sig", encoded).unwrap_err();
        assert!(matches!(err, RpcError::ParseError(_)));
    }

    #[test]
    fn test_token_amount_fallback() {
        assert_eq!(
            token_amount("", 9, "0.25"),
            Some(Decimal::from_str("0.25").unwrap())
        );
        assert_eq!(token_amount("1500", 3, "ignored"), Some(Decimal::new(1500, 3)));
    }

    #[test]
    fn test_instruction_data_bytes() {
        let ix = CompiledInstruction {
            program_id_index: 0,
            accounts: vec![],
            data: bs58::encode(b"swap").into_string(),
        };
        assert_eq!(ix.data_bytes(), b"swap".to_vec());
    }
}
