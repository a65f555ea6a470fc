//! Encoding of results for the C boundary.

use std::fmt::Display;

use serde::Serialize;
use thiserror::Error;

/// A result that could not be serialized.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct EncodeError(#[from] serde_json::Error);

/// What an operation hands back: either the JSON payload or a diagnostic.
///
/// Both travel in the same text channel; the distinction only exists on this
/// side of the boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Success(String),
    Diagnostic(String),
}

impl Response {
    pub fn unmarshal_failed(err: impl Display) -> Self {
        Self::Diagnostic(format!("Failed to unmarshal config, err: {err}"))
    }

    pub fn trace_failed(err: impl Display) -> Self {
        Self::Diagnostic(format!("Failed to run Trace, err: {err}"))
    }

    pub fn marshal_failed(err: impl Display) -> Self {
        Self::Diagnostic(format!("Failed to marshal []ExecutionResult, err: {err}"))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Flattens the response into the text sent to the caller.
    pub fn into_text(self) -> String {
        match self {
            Self::Success(text) | Self::Diagnostic(text) => text,
        }
    }
}

/// Encodes execution results as a JSON array indented by two spaces.
pub fn encode_trace_results<T: Serialize>(results: &[T]) -> Result<String, EncodeError> {
    Ok(serde_json::to_string_pretty(results)?)
}

/// Encodes a witness as compact JSON.
pub fn encode_witness<W: Serialize>(witness: &W) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(witness)?)
}
