//! Ledger data model as served by the node's REST query interface.
//!
//! Field names mirror the node's JSON (`n`, `vout`, `scriptPubKey`,
//! `mediantime`). Blocks and transactions are immutable once fetched.

use crate::amount::Amount;
use crate::error::{Error, Result};
use serde::Deserialize;

/// Summary of the chain the node is following, from the `chaininfo`
/// endpoint. Ingestion refuses to run against the wrong chain.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainInfo {
    pub chain: String,
    /// Height of the chain head.
    pub blocks: u64,
    #[serde(default)]
    pub bestblockhash: String,
}

/// A block at a fixed ledger position with its ordered transactions.
#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    pub hash: String,
    pub height: u64,
    /// Median-time-past; preferred over `time` for analysis (BIP 113).
    #[serde(default)]
    pub mediantime: u64,
    #[serde(rename = "tx")]
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The block's generation transaction. Every well-formed block has one.
    pub fn coinbase(&self) -> Result<&Transaction> {
        self.transactions
            .iter()
            .find(|tx| tx.is_coinbase())
            .ok_or_else(|| Error::NoCoinbase {
                hash: self.hash.clone(),
            })
    }
}

/// A transaction with ordered inputs and outputs.
#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
    pub txid: String,
    #[serde(rename = "vin")]
    pub inputs: Vec<Input>,
    #[serde(rename = "vout")]
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub blockhash: Option<String>,
}

impl Transaction {
    /// True when the single input is the coinbase marker.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].coinbase.is_some()
    }
}

/// Either a reference to a prior output by `(txid, vout)` or the coinbase
/// marker creating new currency.
#[derive(Debug, Clone, Deserialize)]
pub struct Input {
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
}

impl Input {
    /// The `(txid, vout)` this input spends, or `None` for coinbase.
    pub fn outpoint(&self) -> Option<(&str, u32)> {
        match (&self.txid, self.vout) {
            (Some(txid), Some(vout)) => Some((txid.as_str(), vout)),
            _ => None,
        }
    }
}

/// A transaction output: index, value, and locking script summary.
#[derive(Debug, Clone, Deserialize)]
pub struct Output {
    pub value: Amount,
    #[serde(rename = "n")]
    pub index: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

impl Output {
    /// Classify the locking script; unknown kinds are a hard error for
    /// value-bearing outputs, never a silent default.
    pub fn script_kind(&self, txid: &str) -> Result<ScriptKind> {
        ScriptKind::parse(&self.script_pub_key.kind).ok_or_else(|| Error::UnknownScriptKind {
            kind: self.script_pub_key.kind.clone(),
            txid: txid.to_string(),
            vout: self.index,
        })
    }

    /// The destination address, if the node reported one. Raw pay-to-pubkey
    /// outputs in early blocks come back with no address; callers skip those
    /// rather than fail the block.
    pub fn address(&self) -> Option<&str> {
        match self.script_pub_key.address.as_deref() {
            Some(a) if !a.is_empty() => Some(a),
            _ => None,
        }
    }
}

/// Locking-script summary as the node reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

/// The closed set of script classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    PubKey,
    PubKeyHash,
    ScriptHash,
    WitnessV0KeyHash,
    WitnessV0ScriptHash,
    WitnessV1Taproot,
    Multisig,
    /// Data-carrying output; transfers no value.
    NullData,
}

impl ScriptKind {
    /// Parse the node's `type` attribute, case-insensitively. Returns
    /// `None` for anything outside the closed set.
    pub fn parse(kind: &str) -> Option<ScriptKind> {
        match kind.to_ascii_lowercase().as_str() {
            "pubkey" => Some(ScriptKind::PubKey),
            "pubkeyhash" => Some(ScriptKind::PubKeyHash),
            "scripthash" => Some(ScriptKind::ScriptHash),
            "witness_v0_keyhash" => Some(ScriptKind::WitnessV0KeyHash),
            "witness_v0_scripthash" => Some(ScriptKind::WitnessV0ScriptHash),
            "witness_v1_taproot" => Some(ScriptKind::WitnessV1Taproot),
            "multisig" => Some(ScriptKind::Multisig),
            "nulldata" => Some(ScriptKind::NullData),
            _ => None,
        }
    }

    /// Whether outputs of this kind move value at all.
    pub fn transfers_value(self) -> bool {
        !matches!(self, ScriptKind::NullData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_json(value: f64, n: u32, kind: &str, address: Option<&str>) -> String {
        let addr = address
            .map(|a| format!(r#""address":"{a}","#))
            .unwrap_or_default();
        format!(r#"{{"value":{value},"n":{n},"scriptPubKey":{{{addr}"type":"{kind}"}}}}"#)
    }

    #[test]
    fn test_deserialize_output() {
        let json = output_json(6.25, 0, "pubkeyhash", Some("addrA"));
        let out: Output = serde_json::from_str(&json).unwrap();
        assert_eq!(out.value, Amount::from_coins(6.25));
        assert_eq!(out.index, 0);
        assert_eq!(out.script_kind("t").unwrap(), ScriptKind::PubKeyHash);
        assert_eq!(out.address(), Some("addrA"));
    }

    #[test]
    fn test_unknown_script_kind_is_error() {
        let json = output_json(1.0, 2, "nonstandard", Some("x"));
        let out: Output = serde_json::from_str(&json).unwrap();
        let err = out.script_kind("tx9").unwrap_err();
        assert!(matches!(err, Error::UnknownScriptKind { vout: 2, .. }));
        assert!(err.to_string().contains("nonstandard"));
    }

    #[test]
    fn test_output_without_address() {
        let json = output_json(1.0, 0, "pubkey", None);
        let out: Output = serde_json::from_str(&json).unwrap();
        assert_eq!(out.address(), None);
        // The script still classifies as value-bearing.
        assert!(out.script_kind("tx1").unwrap().transfers_value());
    }

    #[test]
    fn test_script_kind_case_insensitive() {
        assert_eq!(ScriptKind::parse("NullData"), Some(ScriptKind::NullData));
        assert_eq!(ScriptKind::parse("PUBKEYHASH"), Some(ScriptKind::PubKeyHash));
        assert_eq!(ScriptKind::parse("bogus"), None);
    }

    #[test]
    fn test_coinbase_detection() {
        let json = r#"{
            "txid":"c0ffee",
            "vin":[{"coinbase":"04ffff001d"}],
            "vout":[]
        }"#;
        let tx: Transaction = serde_json::from_str(json).unwrap();
        assert!(tx.is_coinbase());
        assert!(tx.inputs[0].outpoint().is_none());
    }

    #[test]
    fn test_block_without_coinbase() {
        let json = r#"{"hash":"h","height":5,"tx":[]}"#;
        let block: Block = serde_json::from_str(json).unwrap();
        assert!(matches!(
            block.coinbase().unwrap_err(),
            Error::NoCoinbase { .. }
        ));
    }
}
