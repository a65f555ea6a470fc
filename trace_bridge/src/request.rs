//! Decoding of the JSON requests received over the C boundary.

use std::ffi::{c_char, CStr};

use node_tracer::{TraceConfig, TrieModification};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Request of `GetMptWitness`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessRequest {
    #[serde(rename = "BlockNum", alias = "blockNum")]
    pub block_num: u64,
    #[serde(rename = "NodeUrl", alias = "nodeUrl")]
    pub node_url: String,
    /// Forwarded to the witness engine in order.
    #[serde(rename = "Mods", alias = "modifications")]
    pub modifications: Vec<TrieModification>,
}

/// A request that could not be turned into its typed form.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("request pointer is null")]
    NullPointer,

    #[error("request is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// The text is not JSON of the expected shape. Names the offending field
    /// when there is one.
    #[error("{0}")]
    Json(#[from] serde_path_to_error::Error<serde_json::Error>),

    #[error("{0}")]
    TrailingCharacters(#[source] serde_json::Error),
}

/// Borrows the text behind a caller-provided pointer.
///
/// # Safety
///
/// `raw` must be null or point to a NUL-terminated string that stays valid
/// and unmodified for `'a`.
pub unsafe fn read_foreign_text<'a>(raw: *const c_char) -> Result<&'a str, DecodeError> {
    if raw.is_null() {
        return Err(DecodeError::NullPointer);
    }
    Ok(CStr::from_ptr(raw).to_str()?)
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, DecodeError> {
    let des = &mut serde_json::Deserializer::from_str(text);
    let value = serde_path_to_error::deserialize(&mut *des)?;
    des.end().map_err(DecodeError::TrailingCharacters)?;
    Ok(value)
}

/// Decodes the request of `CreateTrace`.
///
/// Storage keys and values are not checked to pair up; that is left to the
/// trace engine.
pub fn decode_trace_request(text: &str) -> Result<TraceConfig, DecodeError> {
    decode(text)
}

/// Decodes the request of `GetMptWitness`. Modifications are not validated
/// beyond their JSON shape.
pub fn decode_witness_request(text: &str) -> Result<WitnessRequest, DecodeError> {
    decode(text)
}
