//! Block tracing and Merkle-Patricia-Trie witness generation against an
//! Ethereum node.
//!
//! The crate exposes two engine traits, [`TraceEngine`] and
//! [`WitnessEngine`], together with the data they consume and produce. The
//! default implementations, [`trace::NodeTracer`] and
//! [`witness::NodeWitnessGenerator`], talk JSON-RPC to the node named in each
//! request.

pub mod config;
pub mod error;
pub mod provider;
pub mod runtime;
pub mod trace;
pub mod tracing;
pub mod witness;

#[cfg(test)]
pub(crate) mod testing;

use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

pub use crate::error::EngineError;
pub use crate::trace::{ExecutionResult, NodeTracer, StructLog};
pub use crate::witness::{MptWitness, NodeWitnessGenerator, WitnessStep};

/// Configuration of a single block trace.
///
/// `keys` and `values` are positionally paired and describe storage
/// overrides applied to `address` before the block's transactions are
/// executed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(rename = "NodeUrl", alias = "nodeUrl")]
    pub node_url: String,
    #[serde(rename = "BlockNum", alias = "blockNum")]
    pub block_num: u64,
    #[serde(rename = "Addr", alias = "address")]
    pub address: String,
    #[serde(rename = "Keys", alias = "storageKeys")]
    pub keys: Vec<String>,
    #[serde(rename = "Values", alias = "storageValues")]
    pub values: Vec<String>,
}

/// Produces the ordered per-transaction execution results of a block.
pub trait TraceEngine: Send + Sync {
    type Output: Serialize;

    fn trace(&self, config: &TraceConfig) -> Result<Vec<Self::Output>, EngineError>;
}

/// Produces a witness for an ordered list of trie modifications.
///
/// Witness generation has no error channel: implementations report internal
/// failures through logging and return a zero value.
pub trait WitnessEngine: Send + Sync {
    type Output: Serialize;

    fn compute_witness(
        &self,
        node_url: &str,
        block_num: u64,
        modifications: &[TrieModification],
    ) -> Self::Output;
}

/// The kind of change a [`TrieModification`] describes.
///
/// Codes without a known meaning decode to [`ProofType::Other`] and are left
/// for the witness engine to reject.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub enum ProofType {
    #[default]
    Disabled,
    NonceChanged,
    BalanceChanged,
    CodeHashChanged,
    AccountDestructed,
    AccountDoesNotExist,
    StorageChanged,
    StorageDoesNotExist,
    Other(u64),
}

impl From<u64> for ProofType {
    fn from(value: u64) -> Self {
        match value {
            0 => Self::Disabled,
            1 => Self::NonceChanged,
            2 => Self::BalanceChanged,
            3 => Self::CodeHashChanged,
            4 => Self::AccountDestructed,
            5 => Self::AccountDoesNotExist,
            6 => Self::StorageChanged,
            7 => Self::StorageDoesNotExist,
            other => Self::Other(other),
        }
    }
}

impl From<ProofType> for u64 {
    fn from(value: ProofType) -> Self {
        match value {
            ProofType::Disabled => 0,
            ProofType::NonceChanged => 1,
            ProofType::BalanceChanged => 2,
            ProofType::CodeHashChanged => 3,
            ProofType::AccountDestructed => 4,
            ProofType::AccountDoesNotExist => 5,
            ProofType::StorageChanged => 6,
            ProofType::StorageDoesNotExist => 7,
            ProofType::Other(code) => code,
        }
    }
}

impl ProofType {
    /// Whether the modification addresses a storage slot rather than an
    /// account field.
    pub const fn is_storage(self) -> bool {
        matches!(self, Self::StorageChanged | Self::StorageDoesNotExist)
    }
}

/// A single change to the state trie, or a request to prove the absence of
/// one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TrieModification {
    #[serde(rename = "Type")]
    pub kind: ProofType,
    /// Storage slot, for storage modifications.
    pub key: H256,
    /// New storage value, for [`ProofType::StorageChanged`].
    pub value: H256,
    pub address: Address,
    pub nonce: u64,
    #[serde(with = "quantity")]
    pub balance: U256,
    pub code_hash: HexBytes,
}

/// Bytes carried as a `0x`-prefixed hex string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HexBytes(#[serde(with = "crate::hex")] pub Vec<u8>);

impl From<Vec<u8>> for HexBytes {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for HexBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Like `#[serde(with = "::hex")]`, but tolerates and emits leading `0x`
/// prefixes
mod hex {
    use serde::{de::Error as _, Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer, T>(data: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: hex::ToHex,
    {
        let s = data.encode_hex::<String>();
        serializer.serialize_str(&format!("0x{}", s))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, T>(deserializer: D) -> Result<T, D::Error>
    where
        T: hex::FromHex,
        T::Error: std::fmt::Display,
    {
        let s = String::deserialize(deserializer)?;
        match s.strip_prefix("0x") {
            Some(rest) => T::from_hex(rest),
            None => T::from_hex(&*s),
        }
        .map_err(D::Error::custom)
    }
}

/// Integer quantities that may arrive as JSON numbers, decimal strings or
/// `0x`-prefixed hex strings. Always emitted as hex.
///
/// Numbers are read from their raw text, so values beyond `u64` keep every
/// digit.
mod quantity {
    use ethereum_types::U256;
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize as _, Serializer};
    use serde_json::value::RawValue;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        let raw = raw.get();
        if raw.starts_with('"') {
            let text = serde_json::from_str::<String>(raw).map_err(D::Error::custom)?;
            match text.strip_prefix("0x") {
                Some(rest) => U256::from_str_radix(rest, 16).map_err(D::Error::custom),
                None => U256::from_dec_str(&text).map_err(D::Error::custom),
            }
        } else {
            U256::from_dec_str(raw)
                .map_err(|e| D::Error::custom(format!("invalid quantity {raw}: {e:?}")))
        }
    }
}
