//! The two operations, independent of the C ABI.
//!
//! Both follow the same shape (decode, compute, encode) but deliberately
//! differ in how they fail:
//!
//! - [`create_trace`] never fails. Every error, including a panicking engine,
//!   becomes a [`Response::Diagnostic`].
//! - [`get_mpt_witness`] hands decode errors back to its caller, which treats
//!   them as fatal, and turns a witness that cannot be encoded into an empty
//!   payload.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
};

use node_tracer::{TraceEngine, WitnessEngine};
use tracing::{debug, error, warn};

use crate::{
    request::{decode_trace_request, decode_witness_request},
    response::{encode_trace_results, encode_witness},
    DecodeError, Response,
};

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload")
}

/// Traces the block described by `request`.
pub fn create_trace<E: TraceEngine>(engine: &E, request: &str) -> Response {
    let config = match decode_trace_request(request) {
        Ok(config) => config,
        Err(e) => {
            warn!("rejecting trace request: {e}");
            return Response::unmarshal_failed(e);
        }
    };
    debug!(
        block = config.block_num,
        node = %config.node_url,
        overrides = config.keys.len(),
        "trace requested"
    );

    let results = match catch_unwind(AssertUnwindSafe(|| engine.trace(&config))) {
        Ok(Ok(results)) => results,
        Ok(Err(e)) => {
            warn!(block = config.block_num, "trace failed: {e}");
            return Response::trace_failed(e);
        }
        Err(payload) => {
            let message = panic_message(&*payload);
            error!(block = config.block_num, "trace engine panicked: {message}");
            return Response::trace_failed(format!("engine panicked: {message}"));
        }
    };

    match encode_trace_results(&results) {
        Ok(text) => Response::Success(text),
        Err(e) => {
            error!(block = config.block_num, "couldn't encode trace: {e}");
            Response::marshal_failed(e)
        }
    }
}

/// Computes the witness described by `request`.
///
/// Returns `Err` only when the request cannot be decoded. A witness that
/// cannot be encoded is logged and replaced by an empty string.
pub fn get_mpt_witness<E: WitnessEngine>(engine: &E, request: &str) -> Result<String, DecodeError> {
    let request = decode_witness_request(request)?;
    debug!(
        block = request.block_num,
        node = %request.node_url,
        modifications = request.modifications.len(),
        "witness requested"
    );

    let witness =
        engine.compute_witness(&request.node_url, request.block_num, &request.modifications);

    Ok(encode_witness(&witness).unwrap_or_else(|e| {
        error!(block = request.block_num, "couldn't encode witness: {e}");
        String::new()
    }))
}
