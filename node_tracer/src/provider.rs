use std::{
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use alloy::{
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::{
        client::ClientBuilder,
        json_rpc::{RequestPacket, ResponsePacket, RpcParam, RpcReturn},
    },
    transports::{http::ReqwestTransport, Transport, TransportError, TransportFut},
};
use anyhow::Context as _;
use tokio::sync::Semaphore;
use tower::{
    layer::layer_fn,
    retry::{Policy, Retry},
    Service,
};
use tracing::{trace, warn};
use url::Url;

use crate::{config::EngineConfig, EngineError};

/// Provider used by the node-backed engines.
pub type HttpProvider = RootProvider<RetryTransport<ReqwestTransport>>;

/// Wrapper around an alloy provider that bounds the number of JSON-RPC
/// requests in flight at any moment.
pub struct BoundedProvider<ProviderT, TransportT> {
    provider: ProviderT,
    // `Alloy` provider is using `Reqwest` http client under the hood. It has an unbounded
    // connection pool, so the number of parallel requests is limited here.
    semaphore: Semaphore,
    _phantom: PhantomData<TransportT>,
}

impl<ProviderT, TransportT> BoundedProvider<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    pub fn new(provider: ProviderT, max_parallel_requests: usize) -> Self {
        Self {
            provider,
            semaphore: Semaphore::new(max_parallel_requests),
            _phantom: PhantomData,
        }
    }

    /// Sends a raw JSON-RPC request once a permit is available.
    pub async fn request<P, R>(&self, method: &'static str, params: P) -> anyhow::Result<R>
    where
        P: RpcParam,
        R: RpcReturn,
    {
        let _permit = self.semaphore.acquire().await?;
        trace!(method, "sending request");
        self.provider
            .raw_request::<P, R>(method.into(), params)
            .await
            .with_context(|| format!("`{method}` request failed"))
    }
}

/// Connects to `node_url` over HTTP, retrying failed requests as configured.
pub fn connect(
    node_url: &str,
    config: &EngineConfig,
) -> Result<BoundedProvider<HttpProvider, RetryTransport<ReqwestTransport>>, EngineError> {
    let url = Url::parse(node_url).map_err(|source| EngineError::InvalidUrl {
        url: node_url.to_owned(),
        source,
    })?;
    let provider = build_http_retry_provider(url, config.rpc_backoff(), config.rpc_max_retries);
    Ok(BoundedProvider::new(provider, config.max_parallel_requests))
}

pub fn build_http_retry_provider(rpc_url: Url, backoff: Duration, max_retries: u32) -> HttpProvider {
    let policy = RetryPolicy::new(backoff, max_retries);
    let client = ClientBuilder::default()
        .layer(layer_fn(move |inner| RetryTransport::new(policy.clone(), inner)))
        .http(rpc_url);
    ProviderBuilder::new().on_client(client)
}

/// Retries failed transport requests a fixed number of times, sleeping
/// `backoff` before each new attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Duration,
    remaining: u32,
}

impl RetryPolicy {
    pub fn new(backoff: Duration, max_retries: u32) -> Self {
        Self {
            backoff,
            remaining: max_retries,
        }
    }
}

impl Policy<RequestPacket, ResponsePacket, TransportError> for RetryPolicy {
    type Future = Pin<Box<dyn Future<Output = Self> + Send + 'static>>;

    fn retry(
        &self,
        _req: &RequestPacket,
        result: Result<&ResponsePacket, &TransportError>,
    ) -> Option<Self::Future> {
        let err = result.err()?;
        let remaining = self.remaining.checked_sub(1)?;
        warn!(remaining, "retrying failed request: {err}");
        let backoff = self.backoff;
        Some(Box::pin(async move {
            tokio::time::sleep(backoff).await;
            Self { backoff, remaining }
        }))
    }

    fn clone_request(&self, req: &RequestPacket) -> Option<RequestPacket> {
        Some(req.clone())
    }
}

/// [`Retry`] with its future boxed, the shape alloy expects of a transport.
#[derive(Clone)]
pub struct RetryTransport<S>(Retry<RetryPolicy, S>);

impl<S> RetryTransport<S> {
    pub fn new(policy: RetryPolicy, inner: S) -> Self {
        Self(Retry::new(policy, inner))
    }
}

impl<S> Service<RequestPacket> for RetryTransport<S>
where
    S: Service<RequestPacket, Response = ResponsePacket, Error = TransportError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = TransportFut<'static>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        Box::pin(self.0.call(req))
    }
}
