use std::sync::Once;

use tracing_subscriber::{prelude::*, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Installs the global subscriber, filtered by `RUST_LOG`.
///
/// Safe to call any number of times. A subscriber installed by the host
/// process takes precedence.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::Registry::default()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_filter(EnvFilter::from_default_env()),
            )
            .try_init();
    });
}
