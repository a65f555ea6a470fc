//! Offline JSON-RPC plumbing for the engine tests.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    future::ready,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use alloy::{
    providers::RootProvider,
    rpc::json_rpc::{
        ErrorPayload, RequestMeta, RequestPacket, Response, ResponsePacket, ResponsePayload,
    },
    transports::{BoxTransport, TransportConnect, TransportError},
};
use futures::{future::BoxFuture, FutureExt as _};
use serde::Serialize;
use serde_json::Value;
use tower::Service;

type Reply = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Fixed ("canned") responses to JSON-RPC method calls.
///
/// Every request is recorded so tests can inspect what was sent.
#[derive(Clone, Default)]
pub struct Canned {
    method2response: BTreeMap<String, Reply>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Canned {
    pub fn new() -> Self {
        Self::default()
    }

    #[track_caller]
    pub fn respond(self, method: impl Into<String>, response: impl Serialize) -> Self {
        let response = serde_json::to_value(response).expect("serialization failure");
        self.respond_with(method, move |_| response.clone())
    }

    /// Answers `method` with a response computed from the request params.
    #[track_caller]
    pub fn respond_with(
        mut self,
        method: impl Into<String>,
        reply: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        let clobbered = self.method2response.insert(method.into(), Arc::new(reply));
        assert!(
            clobbered.is_none(),
            "duplicate response registered - this is probably not what you want"
        );
        self
    }

    /// `(method, params)` of every request seen so far, in arrival order.
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn into_provider(self) -> RootProvider<BoxTransport> {
        RootProvider::connect_boxed(self)
            .now_or_never()
            .expect("Canned::get_transport is non blocking")
            .expect("Canned::get_transport is infallible")
    }
}

impl TransportConnect for Canned {
    type Transport = Self;
    fn is_local(&self) -> bool {
        true
    }
    fn get_transport<'a: 'b, 'b>(
        &'a self,
    ) -> BoxFuture<'b, Result<Self::Transport, TransportError>> {
        ready(Ok(self.clone())).boxed()
    }
}

impl Service<RequestPacket> for Canned {
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;
    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
    fn call(&mut self, req: RequestPacket) -> Self::Future {
        fn error(message: impl Into<Cow<'static, str>>) -> TransportError {
            TransportError::ErrorResp(ErrorPayload {
                code: 0,
                message: message.into().into_owned(),
                data: None,
            })
        }

        match req {
            RequestPacket::Single(it) => {
                let (RequestMeta { method, id, .. }, request) = it.decompose();
                let params = serde_json::from_str::<Value>(request.get())
                    .ok()
                    .and_then(|mut request| request.get_mut("params").map(Value::take))
                    .unwrap_or(Value::Null);
                let reply = self.method2response.get(&*method).map(|reply| reply(&params));
                self.requests
                    .lock()
                    .unwrap()
                    .push((method.to_string(), params));
                ready(
                    reply
                        .map(|it| {
                            ResponsePacket::Single(Response {
                                id,
                                payload: ResponsePayload::Success(
                                    serde_json::value::to_raw_value(&it).unwrap(),
                                ),
                            })
                        })
                        .ok_or_else(|| error(format!("method {method} not implemented"))),
                )
                .boxed()
            }
            RequestPacket::Batch(_) => {
                ready(Err(error("batched messages are not supported"))).boxed()
            }
        }
    }
}
