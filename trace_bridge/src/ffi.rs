//! The exported C symbols.

#![allow(non_snake_case)]

use std::ffi::c_char;

use node_tracer::{trace::NodeTracer, witness::NodeWitnessGenerator};
use tracing::error;

use crate::{buffer, dispatch, request::read_foreign_text, Response};

/// Traces a block and returns either the JSON results or a diagnostic.
///
/// Never returns null. The result must be released with [`FreeString`].
///
/// # Safety
///
/// `config` must be null or point to a NUL-terminated string that stays
/// valid for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn CreateTrace(config: *const c_char) -> *mut c_char {
    node_tracer::tracing::init();

    let response = match read_foreign_text(config) {
        Ok(text) => dispatch::create_trace(&NodeTracer::from_env(), text),
        Err(e) => Response::unmarshal_failed(e),
    };
    buffer::allocate(response.into_text())
}

/// Computes an MPT witness and returns it as JSON.
///
/// A request that cannot be decoded is fatal: the process aborts. A witness
/// that cannot be encoded yields an empty string. The result must be released
/// with [`FreeString`].
///
/// # Safety
///
/// `request` must be null or point to a NUL-terminated string that stays
/// valid for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn GetMptWitness(request: *const c_char) -> *mut c_char {
    node_tracer::tracing::init();

    let witness = read_foreign_text(request)
        .and_then(|text| dispatch::get_mpt_witness(&NodeWitnessGenerator::from_env(), text));
    match witness {
        Ok(text) => buffer::allocate(text),
        Err(e) => {
            error!("Failed to unmarshal witness request, err: {e}");
            std::process::abort()
        }
    }
}

/// Releases a buffer returned by [`CreateTrace`] or [`GetMptWitness`].
/// Null is ignored.
///
/// # Safety
///
/// `text` must be null or a pointer returned by this library that has not
/// been released yet.
#[no_mangle]
pub unsafe extern "C" fn FreeString(text: *mut c_char) {
    buffer::release(text);
}
