//! The async runtime shared by every caller thread.
//!
//! Engine traits are synchronous; the node-backed engines drive their
//! JSON-RPC futures to completion on this runtime from whatever thread called
//! them.

use std::future::Future;

use once_cell::sync::OnceCell;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::{config::EngineConfig, EngineError};

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

fn runtime(config: &EngineConfig) -> Result<&'static Runtime, EngineError> {
    RUNTIME.get_or_try_init(|| {
        debug!(worker_threads = config.worker_threads, "starting engine runtime");
        Ok(Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("node-tracer")
            .enable_all()
            .build()?)
    })
}

/// Runs `future` to completion on the shared runtime, blocking the calling
/// thread.
///
/// The first call decides the runtime's size. Must not be called from within
/// an async context.
pub fn block_on<F: Future>(config: &EngineConfig, future: F) -> Result<F::Output, EngineError> {
    Ok(runtime(config)?.block_on(future))
}
