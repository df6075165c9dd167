//! Bidirectional JSON‑RPC endpoint.
//!
//! ### Outbound
//! `call` remaps custom procedures, looks the method up in the backend and
//! external endpoint groups, validates params, records a pending entry for
//! calls and hands the (possibly fragmented) payload to the transport. The
//! matching response is validated against the declared `returns` schema
//! before it reaches the caller.
//!
//! ### Inbound
//! `receive` only accepts frontend endpoints, validates params, dispatches to
//! the [`RequestHandler`] and validates the result. Notifications never get a
//! response; their failures surface as a local `Err`.
//!
//! A transport disconnect rejects every pending call but the endpoint stays
//! usable: attaching a new transport resumes traffic.
//!
//! Real transports report to a [`TransportSink`] from [`RpcEndpoint::sink`]
//! rather than to the endpoint itself. Each sink carries the generation of
//! the attachment it was made for, so frames and disconnects from a
//! transport that has since been replaced are ignored.

use std::{
    collections::HashSet,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::{
    chunk::{Chunk, ChunkAssembler, split_payload},
    jsonrpc::{self, Id, Message, Request, Response, RpcOutcome},
    method::resolve_method,
    specification::{ApiSpecification, EndpointDescriptor, EndpointGroup},
    transport::{Channel, FrameSink, Transport, TransportError},
    validator::ErrorDetail,
};

fn summarize(violations: &[ErrorDetail]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("unknown method `{0}`")]
    UnknownMethod(String),

    #[error("invalid params for `{method}`: {}", summarize(.violations))]
    InvalidParams {
        method: String,
        violations: Vec<ErrorDetail>,
    },

    #[error("invalid result of `{method}`: {}", summarize(.violations))]
    InvalidResult {
        method: String,
        violations: Vec<ErrorDetail>,
    },

    #[error("no external application connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection lost while waiting for `{0}`")]
    Disconnected(String),

    #[error("peer error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("procedure `{method}` failed: {message}")]
    Handler { method: String, message: String },

    #[error("could not (de)serialize payload: {0}")]
    Serialization(String),
}

impl RpcError {
    /// JSON-RPC code used when this error is sent as a response.
    pub fn code(&self) -> i64 {
        match self {
            RpcError::UnknownMethod(_) => jsonrpc::METHOD_NOT_FOUND,
            RpcError::InvalidParams { .. } => jsonrpc::INVALID_PARAMS,
            RpcError::InvalidResult { .. } => jsonrpc::INVALID_RESULT,
            RpcError::NotConnected => jsonrpc::EXTERNAL_APPLICATION_NOT_CONNECTED,
            RpcError::Transport(_) | RpcError::Disconnected(_) => jsonrpc::DISCONNECTED,
            RpcError::Remote { code, .. } => *code,
            RpcError::Handler { .. } | RpcError::Serialization(_) => jsonrpc::INTERNAL_ERROR,
        }
    }

    pub fn into_response(self, id: Id) -> Response {
        let data = match &self {
            RpcError::InvalidParams { violations, .. } | RpcError::InvalidResult { violations, .. } => {
                Some(json!(violations))
            }
            RpcError::Remote { data, .. } => data.clone(),
            _ => None,
        };
        let message = match &self {
            RpcError::UnknownMethod(_) => "Method not found".to_owned(),
            RpcError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Response::fail(id, self.code(), message, data)
    }
}

/// Errors a procedure handler can return.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("no handler for `{0}`")]
    NotHandled(String),

    #[error("params do not match: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::InvalidParams(err.to_string())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

/// The procedures the editor exposes to peers.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Every method name this handler serves.
    fn methods(&self) -> Vec<&'static str>;

    /// `Ok(None)` means "no result"; calls are then answered with `null`.
    async fn handle(&self, method: &str, params: Value) -> Result<Option<Value>, HandlerError>;
}

struct PendingCall {
    /// Name used by the caller, before the custom remap.
    method: String,
    descriptor: Arc<EndpointDescriptor>,
    responder: oneshot::Sender<Result<Value, RpcError>>,
}

/// Generation of transports attached without a sink of their own.
const UNSCOPED: u64 = 0;

struct Attached {
    generation: u64,
    transport: Arc<dyn Transport>,
}

pub struct RpcEndpoint {
    spec: Arc<ApiSpecification>,
    handler: Option<Arc<dyn RequestHandler>>,
    registration_warnings: Vec<String>,
    transport: RwLock<Option<Attached>>,
    next_generation: AtomicU64,
    pending: DashMap<String, PendingCall>,
    assembler: Mutex<ChunkAssembler>,
    next_id: AtomicI64,
}

impl RpcEndpoint {
    /// Build an endpoint serving `handler`. Handler methods missing from the
    /// frontend endpoints, and frontend endpoints without a handler, are
    /// reported as warnings.
    pub fn new(spec: Arc<ApiSpecification>, handler: Arc<dyn RequestHandler>) -> Arc<Self> {
        let registration_warnings = check_registration(&spec, handler.as_ref());
        for w in &registration_warnings {
            warn!("{w}");
        }
        Arc::new(Self::build(spec, Some(handler), registration_warnings))
    }

    /// An endpoint that only makes calls; every inbound request is answered
    /// with "method not found".
    pub fn client_only(spec: Arc<ApiSpecification>) -> Arc<Self> {
        Arc::new(Self::build(spec, None, Vec::new()))
    }

    fn build(
        spec: Arc<ApiSpecification>,
        handler: Option<Arc<dyn RequestHandler>>,
        registration_warnings: Vec<String>,
    ) -> Self {
        Self {
            spec,
            handler,
            registration_warnings,
            transport: RwLock::new(None),
            next_generation: AtomicU64::new(UNSCOPED + 1),
            pending: DashMap::new(),
            assembler: Mutex::new(ChunkAssembler::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn specification(&self) -> &Arc<ApiSpecification> {
        &self.spec
    }

    pub fn registration_warnings(&self) -> &[String] {
        &self.registration_warnings
    }

    // ---------------------------------------------------------------------
    // Transport wiring
    // ---------------------------------------------------------------------

    /// A fresh sink for a transport about to be attached with
    /// [`attach_scoped`](Self::attach_scoped).
    pub fn sink(self: &Arc<Self>) -> Arc<TransportSink> {
        Arc::new(TransportSink {
            endpoint: Arc::downgrade(self),
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
        })
    }

    /// Attach a transport that reports to the endpoint directly.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        self.attach(UNSCOPED, transport);
    }

    /// Attach a transport that reports through `sink`. Until the next attach,
    /// only that sink's frames and disconnect are acted on.
    pub fn attach_scoped(&self, sink: &TransportSink, transport: Arc<dyn Transport>) {
        self.attach(sink.generation, transport);
    }

    fn attach(&self, generation: u64, transport: Arc<dyn Transport>) {
        debug!(transport = %transport.describe(), generation, "transport attached");
        if let Ok(mut slot) = self.transport.write() {
            *slot = Some(Attached { generation, transport });
        }
    }

    /// Detach the current transport and reject everything in flight.
    pub fn detach_transport(&self) -> Option<Arc<dyn Transport>> {
        let old = self.transport.write().ok().and_then(|mut slot| slot.take());
        self.reject_all();
        old.map(|a| a.transport)
    }

    /// Like [`detach_transport`](Self::detach_transport), but only when the
    /// attached transport belongs to `sink`.
    pub fn detach_scoped(&self, sink: &TransportSink) -> bool {
        if !self.is_current(sink.generation) {
            return false;
        }
        self.detach_transport();
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.transport
            .read()
            .ok()
            .is_some_and(|slot| slot.as_ref().is_some_and(|a| a.generation == generation))
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|a| a.transport.clone()))
    }

    pub fn is_connected(&self) -> bool {
        self.transport().is_some_and(|t| t.is_open())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Reject every pending call with [`RpcError::Disconnected`] and drop
    /// partially received payloads.
    pub fn reject_all(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        if !keys.is_empty() {
            warn!(pending = keys.len(), "rejecting pending calls");
        }
        for key in keys {
            if let Some((_, call)) = self.pending.remove(&key) {
                let _ = call
                    .responder
                    .send(Err(RpcError::Disconnected(call.method.clone())));
            }
        }
        if let Ok(mut assembler) = self.assembler.lock() {
            assembler.clear();
        }
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    /// Call (or notify) a peer procedure. Notifications resolve to `null` once
    /// sent.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let wire_method = resolve_method(method);
        let descriptor = self
            .spec
            .remote(wire_method)
            .ok_or_else(|| RpcError::UnknownMethod(method.to_owned()))?;

        let violations = descriptor.validate_params(params.as_ref());
        if !violations.is_empty() {
            return Err(RpcError::InvalidParams {
                method: method.to_owned(),
                violations,
            });
        }

        let transport = self.transport().ok_or(RpcError::NotConnected)?;
        let channel = Channel::for_group(descriptor.group);

        if !descriptor.expects_response() {
            let req = Request::notification(wire_method, params);
            self.send_message(transport.as_ref(), channel, &req).await?;
            return Ok(Value::Null);
        }

        let id = Id::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let key = id.key();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            key.clone(),
            PendingCall {
                method: method.to_owned(),
                descriptor: descriptor.clone(),
                responder: tx,
            },
        );

        let req = Request::call(id, wire_method, params);
        if let Err(e) = self.send_message(transport.as_ref(), channel, &req).await {
            self.pending.remove(&key);
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Disconnected(method.to_owned())),
        }
    }

    /// Typed wrapper around [`call`](Self::call).
    pub async fn call_as<P, T>(&self, method: &str, params: &P) -> Result<T, RpcError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let params =
            serde_json::to_value(params).map_err(|e| RpcError::Serialization(e.to_string()))?;
        let result = self.call(method, Some(params)).await?;
        serde_json::from_value(result).map_err(|e| RpcError::Serialization(e.to_string()))
    }

    async fn send_message<M: Serialize>(
        &self,
        transport: &dyn Transport,
        channel: Channel,
        message: &M,
    ) -> Result<(), RpcError> {
        let payload =
            serde_json::to_string(message).map_err(|e| RpcError::Serialization(e.to_string()))?;
        let parts = match transport.max_message_size() {
            Some(max) => split_payload(payload, max),
            None => vec![payload],
        };
        trace!(%channel, parts = parts.len(), "sending");
        for part in parts {
            transport.send(channel, part).await?;
        }
        Ok(())
    }

    fn handle_response(&self, resp: Response) {
        let key = resp.id.key();
        let Some((_, call)) = self.pending.remove(&key) else {
            warn!(id = %resp.id, "response does not match any pending call");
            return;
        };
        let outcome = match resp.into_outcome() {
            RpcOutcome::Failure(err) => Err(RpcError::Remote {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            RpcOutcome::Success(Value::Null) => Ok(Value::Null),
            RpcOutcome::Success(result) => {
                let violations = call.descriptor.validate_result(&result);
                if violations.is_empty() {
                    Ok(result)
                } else {
                    warn!(method = %call.method, "peer returned a result that violates the schema");
                    Err(RpcError::InvalidResult {
                        method: call.method.clone(),
                        violations,
                    })
                }
            }
        };
        // the caller may have gone away
        let _ = call.responder.send(outcome);
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Handle one request from a peer. Calls always get `Ok(Some(response))`;
    /// notifications get `Ok(None)` or the local error.
    pub async fn receive(&self, req: Request) -> Result<Option<Response>, RpcError> {
        let id = req.id.clone();
        let method = req.method.clone();
        let outcome = self.dispatch(req).await;
        match (id, outcome) {
            (Some(id), Ok(value)) => Ok(Some(Response::success(id, value.unwrap_or(Value::Null)))),
            (Some(id), Err(err)) => {
                warn!(%method, "request failed: {err}");
                Ok(Some(err.into_response(id)))
            }
            (None, Ok(_)) => Ok(None),
            (None, Err(err)) => Err(err),
        }
    }

    async fn dispatch(&self, req: Request) -> Result<Option<Value>, RpcError> {
        let descriptor = self
            .spec
            .frontend(&req.method)
            .ok_or_else(|| RpcError::UnknownMethod(req.method.clone()))?;

        let violations = descriptor.validate_params(req.params.as_ref());
        if !violations.is_empty() {
            return Err(RpcError::InvalidParams {
                method: req.method.clone(),
                violations,
            });
        }

        let handler = self
            .handler
            .as_ref()
            .ok_or_else(|| RpcError::UnknownMethod(req.method.clone()))?;
        let params = req.params.unwrap_or_else(|| json!({}));

        let result = match AssertUnwindSafe(handler.handle(&req.method, params))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(HandlerError::NotHandled(m))) => return Err(RpcError::UnknownMethod(m)),
            Ok(Err(HandlerError::InvalidParams(reason))) => {
                return Err(RpcError::InvalidParams {
                    method: req.method.clone(),
                    violations: vec![ErrorDetail {
                        instance_path: String::new(),
                        schema_path: String::new(),
                        message: reason,
                    }],
                });
            }
            Ok(Err(HandlerError::Failed(message))) => {
                return Err(RpcError::Handler {
                    method: req.method.clone(),
                    message,
                });
            }
            Err(_) => {
                return Err(RpcError::Handler {
                    method: req.method.clone(),
                    message: "handler panicked".to_owned(),
                });
            }
        };

        if req.id.is_none() {
            return Ok(None);
        }

        if let Some(value) = &result {
            let violations = descriptor.validate_result(value);
            if !violations.is_empty() {
                return Err(RpcError::InvalidResult {
                    method: req.method.clone(),
                    violations,
                });
            }
        }
        Ok(result)
    }

    async fn route(&self, channel: Channel, value: Value) {
        match serde_json::from_value::<Message>(value) {
            Ok(Message::Request(req)) => {
                let method = req.method.clone();
                match self.receive(req).await {
                    Ok(Some(resp)) => self.reply(channel, resp).await,
                    Ok(None) => {}
                    Err(err) => warn!(%method, "notification failed: {err}"),
                }
            }
            Ok(Message::Response(resp)) => self.handle_response(resp),
            Err(e) => {
                let resp = Response::fail(
                    Id::Null,
                    jsonrpc::INVALID_REQUEST,
                    "Invalid Request",
                    Some(json!(e.to_string())),
                );
                self.reply(channel, resp).await;
            }
        }
    }

    async fn reply(&self, channel: Channel, resp: Response) {
        let Some(transport) = self.transport() else {
            warn!(id = %resp.id, "no transport to deliver response");
            return;
        };
        if let Err(e) = self.send_message(transport.as_ref(), channel, &resp).await {
            warn!(id = %resp.id, "could not deliver response: {e}");
        }
    }
}

#[async_trait]
impl FrameSink for RpcEndpoint {
    async fn handle_frame(&self, channel: Channel, text: String) {
        let value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                let resp = Response::fail(
                    Id::Null,
                    jsonrpc::PARSE_ERROR,
                    "Parse error",
                    Some(json!(e.to_string())),
                );
                self.reply(channel, resp).await;
                return;
            }
        };

        let value = match Chunk::from_value(&value) {
            None => value,
            Some(chunk) => {
                let complete = match self.assembler.lock() {
                    Ok(mut assembler) => assembler.push(chunk),
                    Err(_) => None,
                };
                let Some(full) = complete else {
                    return;
                };
                match serde_json::from_str(&full) {
                    Ok(v) => v,
                    Err(e) => {
                        let resp = Response::fail(
                            Id::Null,
                            jsonrpc::PARSE_ERROR,
                            "Parse error",
                            Some(json!(e.to_string())),
                        );
                        self.reply(channel, resp).await;
                        return;
                    }
                }
            }
        };

        self.route(channel, value).await;
    }

    fn on_disconnect(&self) {
        self.reject_all();
        let closed = self.transport().is_some_and(|t| !t.is_open());
        if closed {
            if let Ok(mut slot) = self.transport.write() {
                *slot = None;
            }
        }
    }
}

/// The endpoint as seen by one attached transport.
pub struct TransportSink {
    endpoint: Weak<RpcEndpoint>,
    generation: u64,
}

impl TransportSink {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[async_trait]
impl FrameSink for TransportSink {
    async fn handle_frame(&self, channel: Channel, text: String) {
        let Some(endpoint) = self.endpoint.upgrade() else { return };
        if !endpoint.is_current(self.generation) {
            debug!(generation = self.generation, "dropping frame from a replaced transport");
            return;
        }
        endpoint.handle_frame(channel, text).await;
    }

    fn on_disconnect(&self) {
        let Some(endpoint) = self.endpoint.upgrade() else { return };
        if endpoint.detach_scoped(self) {
            debug!(generation = self.generation, "attached transport closed");
        } else {
            debug!(generation = self.generation, "replaced transport closed");
        }
    }
}

fn check_registration(spec: &ApiSpecification, handler: &dyn RequestHandler) -> Vec<String> {
    let served: HashSet<&str> = handler.methods().into_iter().collect();
    let declared = spec.group(EndpointGroup::Frontend);

    let mut warnings: Vec<String> = served
        .iter()
        .filter(|m| !declared.contains_key(**m))
        .map(|m| format!("procedure `{m}` is not declared in frontend_endpoints and cannot be called"))
        .collect();
    warnings.extend(
        declared
            .keys()
            .filter(|m| !served.contains(m.as_str()))
            .map(|m| format!("frontend endpoint `{m}` has no registered procedure")),
    );
    warnings.sort();
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MemoryTransport;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        fn methods(&self) -> Vec<&'static str> {
            vec!["status_get", "progress_change", "dataflow_get", "not_in_spec"]
        }

        async fn handle(&self, method: &str, params: Value) -> Result<Option<Value>, HandlerError> {
            match method {
                "status_get" => Ok(Some(json!({"status": {"connected": true}}))),
                "progress_change" => Ok(Some(params)),
                // wrong shape on purpose
                "dataflow_get" => Ok(Some(json!({"graph": 1}))),
                other => Err(HandlerError::NotHandled(other.to_owned())),
            }
        }
    }

    fn endpoint() -> (Arc<RpcEndpoint>, Arc<MemoryTransport>) {
        let spec = Arc::new(ApiSpecification::bundled().unwrap());
        let ep = RpcEndpoint::new(spec, Arc::new(Echo));
        let transport = MemoryTransport::new();
        ep.attach_transport(transport.clone());
        (ep, transport)
    }

    #[tokio::test]
    async fn unknown_method_sends_nothing() {
        let (ep, transport) = endpoint();
        let err = ep.call("nonexistent_method", Some(json!({}))).await.unwrap_err();
        assert_eq!(err, RpcError::UnknownMethod("nonexistent_method".into()));
        assert_eq!(ep.pending_count(), 0);
        assert_eq!(transport.send_count(), 0);
    }

    #[tokio::test]
    async fn invalid_params_send_nothing() {
        let (ep, transport) = endpoint();
        let err = ep
            .call("dataflow_run", Some(json!({"dataflow": {"graph": {"nodes": "x"}}})))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams { ref method, .. } if method == "dataflow_run"));
        assert_eq!(err.code(), jsonrpc::INVALID_PARAMS);
        assert_eq!(transport.send_count(), 0);
        assert_eq!(ep.pending_count(), 0);
    }

    #[tokio::test]
    async fn notification_resolves_after_send() {
        let (ep, transport) = endpoint();
        let v = ep.call("nodes_on_change", Some(json!({"nodes": []}))).await.unwrap();
        assert_eq!(v, Value::Null);
        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.id.is_none());
        assert_eq!(ep.pending_count(), 0);
    }

    #[tokio::test]
    async fn valid_result_is_delivered_unchanged() {
        let (ep, transport) = endpoint();
        let ep2 = ep.clone();
        let call = tokio::spawn(async move { ep2.call("dataflow_run", Some(json!({"dataflow": {"graph": {"nodes": [], "connections": []}}}))).await });

        let (_, req) = transport.next_request().await;
        assert_eq!(ep.pending_count(), 1);
        let result = json!({"type": "OK", "content": "done"});
        ep.handle_frame(Channel::Backend, serde_json::to_string(&Response::success(req.id.unwrap(), result.clone())).unwrap()).await;

        assert_eq!(call.await.unwrap().unwrap(), result);
        assert_eq!(ep.pending_count(), 0);
    }

    #[tokio::test]
    async fn invalid_result_becomes_an_error() {
        let (ep, transport) = endpoint();
        let ep2 = ep.clone();
        let call = tokio::spawn(async move { ep2.call("app_capabilities_get", None).await });

        let (_, req) = transport.next_request().await;
        let bad = Response::success(req.id.unwrap(), json!({"stoppable_methods": "all"}));
        ep.handle_frame(Channel::Backend, serde_json::to_string(&bad).unwrap()).await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::InvalidResult { .. }));
        assert_eq!(err.code(), jsonrpc::INVALID_RESULT);
    }

    #[tokio::test]
    async fn peer_error_is_surfaced() {
        let (ep, transport) = endpoint();
        let ep2 = ep.clone();
        let call = tokio::spawn(async move { ep2.call("frontend_on_connect", None).await });
        let (_, req) = transport.next_request().await;
        let fail = Response::fail(req.id.unwrap(), jsonrpc::METHOD_NOT_FOUND, "Method not found", None);
        ep.handle_frame(Channel::Backend, serde_json::to_string(&fail).unwrap()).await;
        assert_eq!(call.await.unwrap().unwrap_err().code(), jsonrpc::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn disconnect_rejects_every_pending_call() {
        let (ep, transport) = endpoint();
        let mut calls = Vec::new();
        for _ in 0..5 {
            let ep2 = ep.clone();
            calls.push(tokio::spawn(async move { ep2.call("status_get", None).await }));
        }
        for _ in 0..5 {
            transport.next_request().await;
        }
        assert_eq!(ep.pending_count(), 5);

        transport.close();
        ep.on_disconnect();

        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(RpcError::Disconnected(_))));
        }
        assert_eq!(ep.pending_count(), 0);
        assert!(!ep.is_connected());

        // usable again once a transport is back
        let again = MemoryTransport::new();
        ep.attach_transport(again.clone());
        ep.call("nodes_on_change", None).await.unwrap();
        assert_eq!(again.send_count(), 1);
    }

    #[tokio::test]
    async fn replaced_transport_cannot_reject_the_current_one() {
        let ep = RpcEndpoint::new(Arc::new(ApiSpecification::bundled().unwrap()), Arc::new(Echo));
        let old_sink = ep.sink();
        let old = MemoryTransport::new();
        ep.attach_scoped(&old_sink, old.clone());

        let new_sink = ep.sink();
        let new = MemoryTransport::new();
        ep.attach_scoped(&new_sink, new.clone());
        assert_ne!(old_sink.generation(), new_sink.generation());

        let ep2 = ep.clone();
        let call = tokio::spawn(async move { ep2.call("status_get", None).await });
        let (channel, req) = new.next_request().await;

        // the old transport goes away late: ignored, as are its frames
        old.close();
        old_sink.on_disconnect();
        let stale = Response::success(req.id.clone().unwrap(), json!({"status": {"connected": false}}));
        old_sink.handle_frame(channel, serde_json::to_string(&stale).unwrap()).await;
        assert_eq!(ep.pending_count(), 1);
        assert!(ep.transport().is_some());

        let resp = Response::success(req.id.unwrap(), json!({"status": {"connected": true}}));
        new_sink.handle_frame(channel, serde_json::to_string(&resp).unwrap()).await;
        assert_eq!(call.await.unwrap().unwrap(), json!({"status": {"connected": true}}));

        // the current one going away still rejects and detaches
        let ep2 = ep.clone();
        let call = tokio::spawn(async move { ep2.call("status_get", None).await });
        new.next_request().await;
        new.close();
        new_sink.on_disconnect();
        assert!(matches!(call.await.unwrap(), Err(RpcError::Disconnected(_))));
        assert!(ep.transport().is_none());
    }

    #[tokio::test]
    async fn custom_procedures_travel_as_canonical_method() {
        let (ep, transport) = endpoint();
        let ep2 = ep.clone();
        let call = tokio::spawn(async move {
            ep2.call(
                "custom_flash",
                Some(json!({"procedure_name": "custom_flash", "dataflow": {"graph": {"nodes": [], "connections": []}}})),
            )
            .await
        });
        let (channel, req) = transport.next_request().await;
        assert_eq!(channel, Channel::Backend);
        assert_eq!(req.method, "custom_procedure");
        ep.handle_frame(Channel::Backend, serde_json::to_string(&Response::success(req.id.unwrap(), json!({"type": "OK"}))).unwrap()).await;
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn large_requests_are_fragmented() {
        let spec = Arc::new(ApiSpecification::bundled().unwrap());
        let ep = RpcEndpoint::client_only(spec);
        let transport = MemoryTransport::with_max_size(64);
        ep.attach_transport(transport.clone());

        let nodes: Vec<Value> = (0..5).map(|i| json!({"id": format!("n{i}"), "name": "Filter"})).collect();
        ep.call("nodes_on_change", Some(json!({"nodes": nodes}))).await.unwrap();

        let raw = transport.raw();
        assert!(raw.len() > 1);
        let mut assembler = ChunkAssembler::new();
        let mut whole = None;
        for (_, text) in raw {
            let chunk: Chunk = serde_json::from_str(&text).unwrap();
            whole = assembler.push(chunk);
        }
        let req: Request = serde_json::from_str(&whole.unwrap()).unwrap();
        assert_eq!(req.method, "nodes_on_change");
    }

    #[tokio::test]
    async fn inbound_unknown_method_is_method_not_found() {
        let (ep, _) = endpoint();
        let resp = ep
            .receive(Request::call(Id::Number(9), "dataflow_run", None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.error.unwrap().code, jsonrpc::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn inbound_invalid_params() {
        let (ep, _) = endpoint();
        let resp = ep
            .receive(Request::call(Id::Number(1), "progress_change", Some(json!({"progress": "half"}))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.error.unwrap().code, jsonrpc::INVALID_PARAMS);

        // same request as a notification raises locally
        let err = ep
            .receive(Request::notification("progress_change", Some(json!({"progress": "half"}))))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn inbound_notifications_never_answer() {
        let (ep, _) = endpoint();
        let out = ep
            .receive(Request::notification("progress_change", Some(json!({"progress": 40}))))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn inbound_result_is_validated() {
        let (ep, _) = endpoint();
        let ok = ep.receive(Request::call(Id::Number(1), "status_get", None)).await.unwrap().unwrap();
        assert_eq!(ok.result.unwrap(), json!({"status": {"connected": true}}));

        let bad = ep.receive(Request::call(Id::Number(2), "dataflow_get", None)).await.unwrap().unwrap();
        assert_eq!(bad.error.unwrap().code, jsonrpc::INVALID_RESULT);
    }

    #[tokio::test]
    async fn requests_from_frames_are_answered_on_same_channel() {
        let (ep, transport) = endpoint();
        ep.handle_frame(Channel::External, r#"{"jsonrpc":"2.0","method":"status_get","id":"w-1"}"#.into()).await;
        let raw = transport.raw();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].0, Channel::External);
        let resp: Response = serde_json::from_str(&raw[0].1).unwrap();
        assert_eq!(resp.id, Id::String("w-1".into()));

        ep.handle_frame(Channel::Backend, "{not json".into()).await;
        let resp: Response = serde_json::from_str(&transport.raw()[1].1).unwrap();
        assert_eq!(resp.error.unwrap().code, jsonrpc::PARSE_ERROR);
    }

    #[test]
    fn registration_mismatches_are_flagged() {
        let spec = Arc::new(ApiSpecification::bundled().unwrap());
        let ep = RpcEndpoint::new(spec, Arc::new(Echo));
        let warnings = ep.registration_warnings();
        assert!(warnings.iter().any(|w| w.contains("`not_in_spec`")));
        assert!(warnings.iter().any(|w| w.contains("`notification_send`")));
    }
}
