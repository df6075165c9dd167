//! Concrete peers: a backend process behind a WebSocket and another editor
//! window behind an in-process channel.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use bridge_protocol::{
    RpcEndpoint, TransportSink,
    message::StatusResult,
    method::BackendMethod,
    socket::SocketTransport,
    transport::Transport,
    window::{WindowHandle, WindowTransport},
};
use tracing::debug;

use crate::connection::ExternalApplication;

/// Ask the peer whether it considers itself connected.
async fn handshake(endpoint: &RpcEndpoint) -> anyhow::Result<bool> {
    let status: StatusResult = endpoint
        .call_as(BackendMethod::StatusGet.as_str(), &serde_json::json!({}))
        .await
        .context("status handshake")?;
    Ok(status.status.connected)
}

struct OpenSocket {
    socket: Arc<SocketTransport>,
    sink: Arc<TransportSink>,
}

pub struct BackendApplication {
    url: String,
    chunk_threshold: usize,
    endpoint: Arc<RpcEndpoint>,
    socket: Mutex<Option<OpenSocket>>,
}

impl BackendApplication {
    pub fn new(url: impl Into<String>, chunk_threshold: usize, endpoint: Arc<RpcEndpoint>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            chunk_threshold,
            endpoint,
            socket: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn current(&self) -> Option<Arc<SocketTransport>> {
        self.socket
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|open| open.socket.clone()))
    }

    fn take(&self) -> Option<OpenSocket> {
        self.socket.lock().ok().and_then(|mut s| s.take())
    }

    /// Close the socket; the endpoint rejects whatever is still pending.
    pub fn close(&self) {
        if let Some(open) = self.take() {
            open.socket.close();
            self.endpoint.detach_scoped(&open.sink);
        }
    }
}

#[async_trait]
impl ExternalApplication for BackendApplication {
    fn id(&self) -> &str {
        &self.url
    }

    /// An open socket counts as alive. A socket that has closed since the
    /// last probe is forgotten and reported as dead; the next probe opens a
    /// new one, which must pass the handshake again.
    async fn is_connected(&self) -> anyhow::Result<bool> {
        match self.current() {
            Some(socket) if socket.is_open() => return Ok(true),
            Some(_) => {
                debug!(url = %self.url, "backend socket lost");
                self.close();
                return Ok(false);
            }
            None => {}
        }

        let sink = self.endpoint.sink();
        let socket = SocketTransport::connect(&self.url, self.chunk_threshold, sink.clone()).await?;
        debug!(url = %self.url, "backend socket opened");
        self.endpoint.attach_scoped(&sink, socket.clone());
        if let Ok(mut slot) = self.socket.lock() {
            *slot = Some(OpenSocket { socket, sink });
        }
        Ok(true)
    }

    async fn on_connect(&self) -> anyhow::Result<bool> {
        handshake(&self.endpoint).await
    }
}

pub struct FrontendApplication {
    transport: Arc<WindowTransport>,
    sink: Arc<TransportSink>,
    endpoint: Arc<RpcEndpoint>,
}

impl FrontendApplication {
    /// Start exchanging messages with the window behind `handle`.
    pub fn new(handle: WindowHandle, endpoint: Arc<RpcEndpoint>) -> Arc<Self> {
        let sink = endpoint.sink();
        let transport = WindowTransport::spawn(handle, sink.clone());
        endpoint.attach_scoped(&sink, transport.clone());
        Arc::new(Self { transport, sink, endpoint })
    }

    /// Stop listening to the window and release the endpoint if it is
    /// still ours.
    pub fn close(&self) {
        self.transport.close();
        self.endpoint.detach_scoped(&self.sink);
    }
}

#[async_trait]
impl ExternalApplication for FrontendApplication {
    fn id(&self) -> &str {
        self.transport.id()
    }

    async fn is_connected(&self) -> anyhow::Result<bool> {
        Ok(self.transport.is_open())
    }

    async fn on_connect(&self) -> anyhow::Result<bool> {
        handshake(&self.endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_protocol::{
        ApiSpecification,
        jsonrpc::{Request, Response},
    };
    use futures_util::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn endpoint() -> Arc<RpcEndpoint> {
        RpcEndpoint::client_only(Arc::new(ApiSpecification::bundled().unwrap()))
    }

    #[tokio::test]
    async fn window_peer_handshake() {
        let (handle, mut peer) = WindowHandle::pair("editor-2");
        let app = FrontendApplication::new(handle, endpoint());
        assert_eq!(app.id(), "editor-2");
        assert!(app.is_connected().await.unwrap());

        let answer = tokio::spawn(async move {
            let text = peer.received.recv().await.unwrap();
            let req: Request = serde_json::from_str(&text).unwrap();
            assert_eq!(req.method, "status_get");
            let resp = Response::success(req.id.unwrap(), json!({"status": {"connected": true}}));
            peer.post.send(serde_json::to_string(&resp).unwrap()).unwrap();
            peer
        });
        assert!(app.on_connect().await.unwrap());
        drop(answer.await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_error() {
        let app = BackendApplication::new("ws://127.0.0.1:1", 1024, endpoint());
        assert!(app.is_connected().await.is_err());
        assert_eq!(app.id(), "ws://127.0.0.1:1");
        app.close();
    }

    #[tokio::test]
    async fn lost_socket_reports_disconnected_once_then_reconnects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // first connection is dropped right away, the second one stays
            let (first, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(first).await.unwrap();
            drop(ws);
            let (second, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(second).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let ep = endpoint();
        let app = BackendApplication::new(format!("ws://{addr}"), 1024, ep.clone());
        assert!(app.is_connected().await.unwrap());
        tokio::time::timeout(Duration::from_secs(5), async {
            while ep.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(!app.is_connected().await.unwrap());
        assert!(app.current().is_none());
        assert!(app.is_connected().await.unwrap());
        assert!(ep.is_connected());
        app.close();
    }
}
