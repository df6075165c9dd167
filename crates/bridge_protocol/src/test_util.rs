//! Transports for tests: one that only records, one that answers calls from a
//! script.

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{
    Mutex as AsyncMutex,
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

use crate::{
    endpoint::RpcEndpoint,
    jsonrpc::{Request, Response},
    transport::{Channel, FrameSink, Transport, TransportError},
};

/// Records every payload it is asked to send.
pub struct MemoryTransport {
    sent: Mutex<Vec<(Channel, String)>>,
    feed_tx: UnboundedSender<(Channel, String)>,
    feed_rx: AsyncMutex<UnboundedReceiver<(Channel, String)>>,
    open: AtomicBool,
    max_size: Option<usize>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Like [`new`](Self::new) but asks the endpoint to fragment payloads
    /// longer than `max`.
    pub fn with_max_size(max: usize) -> Arc<Self> {
        Self::build(Some(max))
    }

    fn build(max_size: Option<usize>) -> Arc<Self> {
        let (feed_tx, feed_rx) = unbounded_channel();
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            feed_tx,
            feed_rx: AsyncMutex::new(feed_rx),
            open: AtomicBool::new(true),
            max_size,
        })
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn raw(&self) -> Vec<(Channel, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Every sent payload that parses as a request.
    pub fn requests(&self) -> Vec<(Channel, Request)> {
        self.raw()
            .into_iter()
            .filter_map(|(c, text)| serde_json::from_str::<Request>(&text).ok().map(|r| (c, r)))
            .collect()
    }

    /// Wait for the next request sent through this transport.
    pub async fn next_request(&self) -> (Channel, Request) {
        let mut rx = self.feed_rx.lock().await;
        loop {
            let (channel, text) = rx.recv().await.expect("transport dropped");
            if let Ok(req) = serde_json::from_str::<Request>(&text) {
                return (channel, req);
            }
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, channel: Channel, payload: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push((channel, payload.clone()));
        let _ = self.feed_tx.send((channel, payload));
        Ok(())
    }

    fn max_message_size(&self) -> Option<usize> {
        self.max_size
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        "memory".to_owned()
    }
}

/// How a [`ScriptedTransport`] answers a call.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error { code: i64, message: String },
    /// Never answer; the call stays pending.
    Silent,
}

/// Answers calls from a per-method script by feeding responses back into the
/// bound endpoint. Calls without a scripted reply get "method not found".
pub struct ScriptedTransport {
    endpoint: Mutex<Weak<RpcEndpoint>>,
    replies: DashMap<String, Reply>,
    recorder: Arc<MemoryTransport>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoint: Mutex::new(Weak::new()),
            replies: DashMap::new(),
            recorder: MemoryTransport::new(),
        })
    }

    /// Attach to `endpoint` so responses have somewhere to go.
    pub fn bind(self: &Arc<Self>, endpoint: &Arc<RpcEndpoint>) {
        *self.endpoint.lock().unwrap() = Arc::downgrade(endpoint);
        endpoint.attach_transport(self.clone());
    }

    pub fn reply(&self, method: &str, reply: Reply) -> &Self {
        self.replies.insert(method.to_owned(), reply);
        self
    }

    pub fn recorder(&self) -> &MemoryTransport {
        &self.recorder
    }

    /// Methods of every request sent so far, in order.
    pub fn methods(&self) -> Vec<String> {
        self.recorder.requests().into_iter().map(|(_, r)| r.method).collect()
    }

    pub fn close(&self) {
        self.recorder.close();
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, channel: Channel, payload: String) -> Result<(), TransportError> {
        self.recorder.send(channel, payload.clone()).await?;

        let Ok(req) = serde_json::from_str::<Request>(&payload) else {
            return Ok(());
        };
        let Some(id) = req.id else {
            return Ok(());
        };
        let reply = self.replies.get(&req.method).map(|r| r.clone());
        let response = match reply {
            Some(Reply::Result(v)) => Response::success(id, v),
            Some(Reply::Error { code, message }) => Response::fail(id, code, message, None),
            Some(Reply::Silent) => return Ok(()),
            None => Response::fail(id, crate::jsonrpc::METHOD_NOT_FOUND, "Method not found", None),
        };

        let endpoint = self.endpoint.lock().unwrap().upgrade();
        if let Some(endpoint) = endpoint {
            let text = serde_json::to_string(&response).unwrap();
            tokio::spawn(async move { endpoint.handle_frame(channel, text).await });
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.recorder.is_open()
    }

    fn describe(&self) -> String {
        "scripted".to_owned()
    }
}
