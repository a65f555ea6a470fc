//! C ABI for block tracing and MPT witness generation.
//!
//! The shared library exports three symbols:
//!
//! - `CreateTrace(config) -> text`: traces a block. Returns the indented JSON
//!   array of execution results, or a human-readable diagnostic starting with
//!   `Failed to`. The two share one channel; callers tell them apart by
//!   trying to parse the text as JSON.
//! - `GetMptWitness(request) -> text`: computes an MPT witness. A malformed
//!   request aborts the process; a witness that cannot be serialized yields
//!   an empty string.
//! - `FreeString(text)`: releases a buffer returned by either of the above.
//!
//! All text is NUL-terminated UTF-8. Every returned buffer must be passed to
//! `FreeString` exactly once.
//!
//! The request/response plumbing is available to Rust callers through
//! [`dispatch`], generic over the engines of [`node_tracer`].

pub mod buffer;
pub mod dispatch;
pub mod ffi;
pub mod request;
pub mod response;

pub use crate::buffer::ForeignBuffer;
pub use crate::request::{DecodeError, WitnessRequest};
pub use crate::response::{EncodeError, Response};
