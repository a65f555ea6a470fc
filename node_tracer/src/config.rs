use std::time::Duration;

use clap::Parser;
use once_cell::sync::OnceCell;

use crate::EngineError;

const HELP_HEADING: &str = "Node engine options";

static GLOBAL: OnceCell<EngineConfig> = OnceCell::new();

/// Settings of the node-backed engines.
///
/// Every option is read from its environment variable; no process arguments
/// are consumed, since the engines usually run inside a host process that
/// owns its own command line.
#[derive(Parser, Clone, PartialEq, Eq, Debug)]
#[command(name = "node_tracer", no_binary_name = true)]
pub struct EngineConfig {
    /// Number of worker threads of the shared async runtime.
    #[arg(long, env = "TRACE_BRIDGE_WORKER_THREADS", help_heading = HELP_HEADING, default_value_t = 4)]
    pub worker_threads: usize,
    /// Upper bound on JSON-RPC requests in flight for a single call. Must be
    /// greater than zero.
    #[arg(long, env = "TRACE_BRIDGE_MAX_PARALLEL_REQUESTS", help_heading = HELP_HEADING, default_value_t = 16)]
    pub max_parallel_requests: usize,
    /// Delay in milliseconds before retrying a failed JSON-RPC request.
    #[arg(long, env = "TRACE_BRIDGE_RPC_BACKOFF_MS", help_heading = HELP_HEADING, default_value_t = 0)]
    pub rpc_backoff_ms: u64,
    /// How often a failed JSON-RPC request is retried.
    #[arg(long, env = "TRACE_BRIDGE_RPC_MAX_RETRIES", help_heading = HELP_HEADING, default_value_t = 0)]
    pub rpc_max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_parallel_requests: 16,
            rpc_backoff_ms: 0,
            rpc_max_retries: 0,
        }
    }
}

impl EngineConfig {
    /// Reads the configuration from the environment, honouring a `.env` file
    /// in the working directory.
    pub fn from_env() -> Result<Self, EngineError> {
        dotenvy::dotenv().ok();
        let config = Self::try_parse_from(std::iter::empty::<String>())
            .map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The process-wide configuration, loaded from the environment on first
    /// use.
    pub fn global() -> Result<&'static Self, EngineError> {
        GLOBAL.get_or_try_init(Self::from_env)
    }

    pub fn rpc_backoff(&self) -> Duration {
        Duration::from_millis(self.rpc_backoff_ms)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.worker_threads == 0 {
            return Err(EngineError::Config(
                "worker_threads must be greater than zero".into(),
            ));
        }
        if self.max_parallel_requests == 0 {
            return Err(EngineError::Config(
                "max_parallel_requests must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::*;

    #[test]
    fn parses_without_arguments() {
        let_assert!(Ok(config) = EngineConfig::try_parse_from(["--worker-threads", "2"]));
        check!(config.worker_threads == 2);
        check!(config.max_parallel_requests >= 1);
    }

    #[test]
    fn rejects_zero_parallelism() {
        let config = EngineConfig {
            max_parallel_requests: 0,
            ..Default::default()
        };
        let_assert!(Err(EngineError::Config(msg)) = config.validate());
        check!(msg.contains("max_parallel_requests"));
    }

    #[test]
    fn backoff_is_in_milliseconds() {
        let config = EngineConfig {
            rpc_backoff_ms: 250,
            ..Default::default()
        };
        check!(config.rpc_backoff() == Duration::from_millis(250));
    }
}
