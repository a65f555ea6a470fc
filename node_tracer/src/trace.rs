//! Block tracing through `debug_traceCall`.

use std::collections::BTreeMap;

use alloy::{providers::Provider, transports::Transport};
use anyhow::{anyhow, Context as _};
use ethereum_types::{Address, H256, U256};
use futures::{StreamExt as _, TryStreamExt as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
    config::EngineConfig,
    provider::{self, BoundedProvider},
    runtime, EngineError, HexBytes, TraceConfig, TraceEngine,
};

/// Outcome of executing one transaction, as reported by the node's struct
/// logger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub gas: u64,
    pub failed: bool,
    #[serde(default)]
    pub return_value: String,
    #[serde(default)]
    pub struct_logs: Vec<StructLog>,
}

/// One executed opcode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructLog {
    pub pc: u64,
    pub op: String,
    pub gas: u64,
    pub gas_cost: u64,
    pub depth: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<BTreeMap<String, String>>,
}

/// Traces blocks against the node named in each [`TraceConfig`].
///
/// Without storage overrides the block is traced as it was executed, through
/// `debug_traceBlockByNumber`.
///
/// Nodes cannot trace a whole block under state overrides, so with overrides
/// every transaction is replayed with `debug_traceCall` on the parent block's
/// state, in the block's context (number, timestamp, coinbase, gas limit and
/// base fee). Each replay starts from the parent state: a transaction does
/// not see the writes of the transactions before it.
#[derive(Clone, Debug, Default)]
pub struct NodeTracer {
    config: Option<EngineConfig>,
}

impl NodeTracer {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Some(config),
        }
    }

    /// A tracer using the process-wide [`EngineConfig::global`].
    pub fn from_env() -> Self {
        Self::default()
    }

    fn config(&self) -> Result<&EngineConfig, EngineError> {
        match &self.config {
            Some(config) => Ok(config),
            None => EngineConfig::global(),
        }
    }
}

impl TraceEngine for NodeTracer {
    type Output = ExecutionResult;

    fn trace(&self, config: &TraceConfig) -> Result<Vec<ExecutionResult>, EngineError> {
        let engine_config = self.config()?;
        let overrides = StorageOverride::from_config(config)?;
        let provider = provider::connect(&config.node_url, engine_config)?;
        let results = runtime::block_on(
            engine_config,
            trace_block(&provider, config.block_num, overrides.as_ref()),
        )??;
        info!(
            block = config.block_num,
            transactions = results.len(),
            "traced block"
        );
        Ok(results)
    }
}

/// Storage slots of one account replaced before tracing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageOverride {
    pub address: Address,
    pub slots: Vec<(H256, H256)>,
}

impl StorageOverride {
    /// Pairs the configured keys and values positionally. Returns `None` when
    /// the configuration names neither an account nor any slot.
    pub fn from_config(config: &TraceConfig) -> Result<Option<Self>, EngineError> {
        if config.address.is_empty() && config.keys.is_empty() && config.values.is_empty() {
            return Ok(None);
        }
        if config.keys.len() != config.values.len() {
            return Err(EngineError::OverrideMismatch {
                keys: config.keys.len(),
                values: config.values.len(),
            });
        }

        let address = Address::from(parse_fixed::<20>("address", &config.address)?);
        let slots = config
            .keys
            .iter()
            .zip(&config.values)
            .map(|(key, value)| {
                Ok((
                    H256::from(parse_fixed::<32>("storage key", key)?),
                    H256::from(parse_fixed::<32>("storage value", value)?),
                ))
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        Ok(Some(Self { address, slots }))
    }

    /// The `stateOverrides` object understood by `debug_traceCall`.
    pub fn to_json(&self) -> Value {
        let state_diff = self
            .slots
            .iter()
            .map(|(key, value)| (format!("{key:?}"), json!(value)))
            .collect::<serde_json::Map<_, _>>();
        json!({ format!("{:?}", self.address): { "stateDiff": state_diff } })
    }
}

/// Parses hex into `N` bytes, left-padding shorter input with zeros.
fn parse_fixed<const N: usize>(what: &'static str, value: &str) -> Result<[u8; N], EngineError> {
    let invalid = |reason: String| EngineError::InvalidHex {
        what,
        value: value.to_owned(),
        reason,
    };
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return Err(invalid("empty".into()));
    }
    let digits = if digits.len() % 2 == 1 {
        format!("0{digits}")
    } else {
        digits.to_owned()
    };
    let bytes = hex::decode(digits).map_err(|e| invalid(e.to_string()))?;
    if bytes.len() > N {
        return Err(invalid(format!("longer than {N} bytes")));
    }
    let mut out = [0u8; N];
    out[N - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Block {
    number: U256,
    timestamp: U256,
    miner: Address,
    gas_limit: U256,
    #[serde(default)]
    base_fee_per_gas: Option<U256>,
    transactions: Vec<BlockTransaction>,
}

impl Block {
    /// The `blockOverrides` that execute a call in the context of this block.
    fn context(&self) -> Value {
        let mut context = json!({
            "number": self.number,
            "time": self.timestamp,
            "coinbase": self.miner,
            "gasLimit": self.gas_limit,
        });
        if let Some(base_fee) = self.base_fee_per_gas {
            context["baseFee"] = json!(base_fee);
        }
        context
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockTransaction {
    hash: H256,
    from: Address,
    to: Option<Address>,
    nonce: U256,
    gas: U256,
    #[serde(default)]
    gas_price: Option<U256>,
    #[serde(default)]
    max_fee_per_gas: Option<U256>,
    #[serde(default)]
    max_priority_fee_per_gas: Option<U256>,
    value: U256,
    input: HexBytes,
}

impl BlockTransaction {
    fn as_call(&self) -> Value {
        let mut call = json!({
            "from": self.from,
            "to": self.to,
            "nonce": self.nonce,
            "gas": self.gas,
            "value": self.value,
            "data": self.input,
        });
        // Nodes refuse calls carrying both fee models.
        match self.max_fee_per_gas {
            Some(max_fee) => {
                call["maxFeePerGas"] = json!(max_fee);
                call["maxPriorityFeePerGas"] =
                    json!(self.max_priority_fee_per_gas.unwrap_or_default());
            }
            None => call["gasPrice"] = json!(self.gas_price.unwrap_or_default()),
        }
        call
    }
}

/// One entry of a `debug_traceBlockByNumber` response.
#[derive(Debug, Deserialize)]
struct TransactionTrace {
    #[serde(default)]
    result: Option<ExecutionResult>,
    #[serde(default)]
    error: Option<String>,
}

fn struct_logger_options() -> Value {
    json!({ "enableMemory": true, "enableReturnData": true })
}

/// Returns one [`ExecutionResult`] per transaction of `block_num`, in block
/// order. See [`NodeTracer`] for how `overrides` changes the strategy.
pub async fn trace_block<ProviderT, TransportT>(
    provider: &BoundedProvider<ProviderT, TransportT>,
    block_num: u64,
    overrides: Option<&StorageOverride>,
) -> anyhow::Result<Vec<ExecutionResult>>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    match overrides {
        None => trace_executed_block(provider, block_num).await,
        Some(overrides) => replay_block(provider, block_num, overrides).await,
    }
}

async fn trace_executed_block<ProviderT, TransportT>(
    provider: &BoundedProvider<ProviderT, TransportT>,
    block_num: u64,
) -> anyhow::Result<Vec<ExecutionResult>>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    debug!(block = block_num, "tracing executed block");
    provider
        .request::<_, Vec<TransactionTrace>>(
            "debug_traceBlockByNumber",
            (format!("{block_num:#x}"), struct_logger_options()),
        )
        .await?
        .into_iter()
        .enumerate()
        .map(|(i, trace)| match trace.result {
            Some(result) => Ok(result),
            None => Err(anyhow!(
                "couldn't trace transaction {i}: {}",
                trace.error.as_deref().unwrap_or("no result")
            )),
        })
        .collect()
}

async fn replay_block<ProviderT, TransportT>(
    provider: &BoundedProvider<ProviderT, TransportT>,
    block_num: u64,
    overrides: &StorageOverride,
) -> anyhow::Result<Vec<ExecutionResult>>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    let block = provider
        .request::<_, Option<Block>>("eth_getBlockByNumber", (format!("{block_num:#x}"), true))
        .await?
        .with_context(|| format!("block {block_num} does not exist"))?;

    let parent = format!("{:#x}", block_num.saturating_sub(1));
    let mut options = struct_logger_options();
    options["stateOverrides"] = overrides.to_json();
    options["blockOverrides"] = block.context();
    debug!(
        block = block_num,
        transactions = block.transactions.len(),
        "replaying block with storage overrides"
    );

    let concurrency = block.transactions.len().max(1);
    futures::stream::iter(block.transactions.iter().map(|tx| {
        let params = (tx.as_call(), parent.clone(), options.clone());
        async move {
            provider
                .request::<_, ExecutionResult>("debug_traceCall", params)
                .await
                .with_context(|| format!("couldn't trace transaction {:?}", tx.hash))
        }
    }))
    .buffered(concurrency)
    .try_collect()
    .await
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::*;
    use crate::testing::Canned;

    fn config() -> TraceConfig {
        TraceConfig {
            node_url: "http://localhost:8545".into(),
            block_num: 5,
            address: "0xabc".into(),
            keys: vec!["0x1".into(), "0x2".into()],
            values: vec!["0x10".into(), "0x20".into()],
        }
    }

    fn legacy_tx(nonce: u64, gas: u64) -> Value {
        json!({
            "hash": H256::from_low_u64_be(nonce),
            "from": Address::from_low_u64_be(0xc014ba5e),
            "to": Address::from_low_u64_be(0xabc),
            "nonce": U256::from(nonce),
            "gas": U256::from(gas),
            "gasPrice": "0x9",
            "value": "0x0",
            "input": "0x",
        })
    }

    fn dynamic_fee_tx(nonce: u64, gas: u64) -> Value {
        let mut tx = legacy_tx(nonce, gas);
        tx["maxFeePerGas"] = json!("0xa");
        tx["maxPriorityFeePerGas"] = json!("0x1");
        tx
    }

    fn block(transactions: Vec<Value>) -> Value {
        json!({
            "number": "0x5",
            "timestamp": "0x64",
            "miner": Address::from_low_u64_be(0xc0ffee),
            "gasLimit": "0x1c9c380",
            "baseFeePerGas": "0x7",
            "transactions": transactions,
        })
    }

    fn quantity(value: &Value) -> u64 {
        u64::from_str_radix(value.as_str().unwrap().trim_start_matches("0x"), 16).unwrap()
    }

    fn result_with_gas(gas: u64) -> ExecutionResult {
        ExecutionResult {
            gas,
            failed: false,
            return_value: String::new(),
            struct_logs: vec![StructLog {
                pc: 0,
                op: "STOP".into(),
                gas,
                gas_cost: 0,
                depth: 1,
                ..Default::default()
            }],
        }
    }

    #[test]
    fn overrides_pair_keys_with_values() {
        let_assert!(Ok(Some(overrides)) = StorageOverride::from_config(&config()));
        check!(overrides.address == Address::from_low_u64_be(0xabc));
        check!(
            overrides.slots
                == vec![
                    (H256::from_low_u64_be(1), H256::from_low_u64_be(0x10)),
                    (H256::from_low_u64_be(2), H256::from_low_u64_be(0x20)),
                ]
        );

        let json = overrides.to_json();
        let diff = &json[format!("{:?}", Address::from_low_u64_be(0xabc))]["stateDiff"];
        check!(diff[format!("{:?}", H256::from_low_u64_be(2))] == json!(H256::from_low_u64_be(0x20)));
    }

    #[test]
    fn no_overrides_without_account() {
        let config = TraceConfig {
            address: String::new(),
            keys: Vec::new(),
            values: Vec::new(),
            ..config()
        };
        let_assert!(Ok(None) = StorageOverride::from_config(&config));
    }

    #[test]
    fn override_mismatch_is_an_error() {
        let config = TraceConfig {
            values: vec!["0x10".into()],
            ..config()
        };
        let_assert!(
            Err(EngineError::OverrideMismatch { keys: 2, values: 1 }) =
                StorageOverride::from_config(&config)
        );
    }

    #[test]
    fn invalid_hex_names_the_field() {
        let config = TraceConfig {
            keys: vec!["k1".into()],
            values: vec!["v1".into()],
            ..config()
        };
        let_assert!(
            Err(EngineError::InvalidHex { what, value, .. }) = StorageOverride::from_config(&config)
        );
        check!(what == "storage key");
        check!(value == "k1");
    }

    #[test]
    fn oversized_address_is_rejected() {
        let_assert!(Err(EngineError::InvalidHex { reason, .. }) = parse_fixed::<20>("address", &"ab".repeat(21)));
        check!(reason.contains("longer than 20 bytes"));
    }

    #[test]
    fn malformed_node_url_fails_before_any_request() {
        let tracer = NodeTracer::new(EngineConfig::default());
        let config = TraceConfig {
            node_url: "::not a url::".into(),
            ..config()
        };
        let_assert!(Err(EngineError::InvalidUrl { .. }) = tracer.trace(&config));
    }

    #[test]
    fn empty_address_with_slots_is_rejected() {
        let config = TraceConfig {
            address: String::new(),
            ..config()
        };
        let_assert!(
            Err(EngineError::InvalidHex { what, reason, .. }) =
                StorageOverride::from_config(&config)
        );
        check!(what == "address");
        check!(reason == "empty");
    }

    #[tokio::test]
    async fn replays_every_transaction_in_block_order() {
        // Each trace echoes the gas of the call it was asked for.
        let canned = Canned::new()
            .respond(
                "eth_getBlockByNumber",
                block(vec![
                    legacy_tx(1, 21000),
                    dynamic_fee_tx(2, 30000),
                    legacy_tx(3, 40000),
                ]),
            )
            .respond_with("debug_traceCall", |params| {
                json!(result_with_gas(quantity(&params[0]["gas"])))
            });
        let provider = BoundedProvider::new(canned.clone().into_provider(), 2);
        let overrides = StorageOverride::from_config(&config()).unwrap();

        let results = trace_block(&provider, 5, overrides.as_ref()).await.unwrap();
        check!(
            results
                == vec![
                    result_with_gas(21000),
                    result_with_gas(30000),
                    result_with_gas(40000)
                ]
        );

        let requests = canned.requests();
        check!(requests[0].0 == "eth_getBlockByNumber");
        check!(requests[0].1 == json!(["0x5", true]));
        let calls = requests
            .iter()
            .filter(|(method, _)| method == "debug_traceCall")
            .map(|(_, params)| params)
            .collect::<Vec<_>>();
        check!(calls.len() == 3);
        for params in &calls {
            check!(params[1] == json!("0x4"));
            check!(params[2]["stateOverrides"].is_object());
            check!(params[2]["enableMemory"] == json!(true));
            check!(
                params[2]["blockOverrides"]
                    == json!({
                        "number": "0x5",
                        "time": "0x64",
                        "coinbase": Address::from_low_u64_be(0xc0ffee),
                        "gasLimit": "0x1c9c380",
                        "baseFee": "0x7",
                    })
            );
        }

        let_assert!(Some(legacy) = calls.iter().find(|p| p[0]["nonce"] == json!("0x1")));
        check!(legacy[0]["gasPrice"] == json!("0x9"));
        check!(legacy[0].get("maxFeePerGas").is_none());
        let_assert!(Some(dynamic) = calls.iter().find(|p| p[0]["nonce"] == json!("0x2")));
        check!(dynamic[0]["maxFeePerGas"] == json!("0xa"));
        check!(dynamic[0]["maxPriorityFeePerGas"] == json!("0x1"));
        check!(dynamic[0].get("gasPrice").is_none());
    }

    #[tokio::test]
    async fn traces_executed_block_without_overrides() {
        let canned = Canned::new().respond(
            "debug_traceBlockByNumber",
            json!([
                { "txHash": H256::from_low_u64_be(1), "result": result_with_gas(21000) },
                { "txHash": H256::from_low_u64_be(2), "result": result_with_gas(30000) },
            ]),
        );
        let provider = BoundedProvider::new(canned.clone().into_provider(), 1);

        let results = trace_block(&provider, 5, None).await.unwrap();
        check!(results == vec![result_with_gas(21000), result_with_gas(30000)]);

        let requests = canned.requests();
        check!(requests.len() == 1);
        check!(requests[0].0 == "debug_traceBlockByNumber");
        check!(
            requests[0].1 == json!(["0x5", { "enableMemory": true, "enableReturnData": true }])
        );
    }

    #[tokio::test]
    async fn failed_transaction_trace_is_reported() {
        let canned = Canned::new().respond(
            "debug_traceBlockByNumber",
            json!([{ "result": result_with_gas(21000) }, { "error": "execution timeout" }]),
        );
        let provider = BoundedProvider::new(canned.into_provider(), 1);
        let_assert!(Err(e) = trace_block(&provider, 5, None).await);
        check!(e.to_string() == "couldn't trace transaction 1: execution timeout");
    }

    #[tokio::test]
    async fn empty_block_yields_no_results() {
        let canned = Canned::new().respond("debug_traceBlockByNumber", json!([]));
        let provider = BoundedProvider::new(canned.into_provider(), 1);
        let results = trace_block(&provider, 0, None).await.unwrap();
        check!(results.is_empty());
    }

    #[tokio::test]
    async fn missing_block_is_reported() {
        let canned = Canned::new().respond("eth_getBlockByNumber", Value::Null);
        let provider = BoundedProvider::new(canned.into_provider(), 1);
        let overrides = StorageOverride::from_config(&config()).unwrap();
        let_assert!(Err(e) = trace_block(&provider, 5, overrides.as_ref()).await);
        check!(e.to_string() == "block 5 does not exist");
    }
}
