use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network selection. Only affects address encoding (version bytes and
/// bech32 prefix), never RPC semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Version byte prepended to a P2PKH pubkey hash before base58check.
    pub fn p2pkh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet => 0x6f,
        }
    }

    /// Version byte prepended to a P2SH script hash before base58check.
    pub fn p2sh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x05,
            Network::Testnet => 0xc4,
        }
    }

    /// Human-readable part for bech32/bech32m witness addresses.
    pub fn hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "bc",
            Network::Testnet => "tb",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" | "testnet4" => Ok(Network::Testnet),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// Reference to a transaction output: the UTXO key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Transaction id, hex in display order as reported by the node.
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }

    /// Storage key: 32 txid bytes followed by the little-endian vout.
    ///
    /// Txids are validated as 64-char hex at RPC decode time; a non-hex
    /// txid (fixture data) falls back to its raw UTF-8 bytes.
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = hex::decode(&self.txid).unwrap_or_else(|_| self.txid.as_bytes().to_vec());
        key.extend_from_slice(&self.vout.to_le_bytes());
        key
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A transaction input. `prevout` is `None` for coinbase inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct TxInput {
    pub prevout: Option<OutPoint>,
}

/// A transaction output carrying a value in sats and its raw script.
#[derive(Debug, Clone, PartialEq)]
pub struct TxOutput {
    pub n: u32,
    pub value: u64,
    pub script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub txid: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// A fully decoded block as fetched from the node (verbosity=2),
/// immutable once fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub hash: String,
    pub height: i64,
    /// Absent only on the genesis block.
    pub prev_hash: Option<String>,
    pub txs: Vec<Transaction>,
}

/// Value side of a UTXO entry. `address` is `None` for scripts the
/// derivation engine does not recognize; such value belongs to no
/// trackable address and never touches any balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub address: Option<String>,
    pub value: u64,
    pub height: i64,
}

/// Last successfully committed block. Sole source of truth for resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: i64,
    pub hash: String,
}

/// Advisory run counters. Not required for correctness; the checkpoint
/// alone decides where to resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub blocks_processed: u64,
    pub failures: u64,
    pub reorgs: u64,
    pub last_rpc_latency_ms: u64,
}
