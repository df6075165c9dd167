//! In-process message channel between two editor windows.
//!
//! Messages are plain JSON-RPC text, never fragmented, and always belong to
//! the external channel.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{Channel, FrameSink, Transport, TransportError};

/// Our side of a window pair: what we can post to and where replies arrive.
#[derive(Debug)]
pub struct WindowHandle {
    pub id: String,
    pub outbox: UnboundedSender<String>,
    pub inbox: UnboundedReceiver<String>,
}

/// The other window's side of the pair.
#[derive(Debug)]
pub struct WindowPeer {
    pub id: String,
    pub received: UnboundedReceiver<String>,
    pub post: UnboundedSender<String>,
}

impl WindowHandle {
    /// Create a connected pair for the window `id`.
    pub fn pair(id: impl Into<String>) -> (WindowHandle, WindowPeer) {
        let id = id.into();
        let (to_peer, peer_rx) = unbounded_channel();
        let (to_us, our_rx) = unbounded_channel();
        (
            WindowHandle { id: id.clone(), outbox: to_peer, inbox: our_rx },
            WindowPeer { id, received: peer_rx, post: to_us },
        )
    }
}

pub struct WindowTransport {
    id: String,
    outbox: UnboundedSender<String>,
    cancel: CancellationToken,
}

impl WindowTransport {
    /// Start forwarding the handle's inbox into `sink` until the other
    /// window goes away or [`close`](Self::close) is called.
    pub fn spawn(handle: WindowHandle, sink: Arc<dyn FrameSink>) -> Arc<Self> {
        let WindowHandle { id, outbox, mut inbox } = handle;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = inbox.recv() => match msg {
                        Some(text) => sink.handle_frame(Channel::External, text).await,
                        None => break,
                    },
                }
            }
            debug!(window = %task_id, "window channel closed");
            sink.on_disconnect();
        });
        Arc::new(Self { id, outbox, cancel })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop listening to the window; later sends fail.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for WindowTransport {
    async fn send(&self, _channel: Channel, payload: String) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbox.send(payload).map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbox.is_closed()
    }

    fn describe(&self) -> String {
        format!("window {}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Sink {
        seen: Mutex<Vec<String>>,
        closed: Notify,
    }

    #[async_trait]
    impl FrameSink for Sink {
        async fn handle_frame(&self, _channel: Channel, text: String) {
            self.seen.lock().unwrap().push(text);
        }
        fn on_disconnect(&self) {
            self.closed.notify_one();
        }
    }

    #[tokio::test]
    async fn posts_and_receives() {
        let (handle, mut peer) = WindowHandle::pair("editor-2");
        let sink = Arc::new(Sink::default());
        let transport = WindowTransport::spawn(handle, sink.clone());

        transport.send(Channel::External, "hello".into()).await.unwrap();
        assert_eq!(peer.received.recv().await.unwrap(), "hello");

        peer.post.send("reply".into()).unwrap();
        drop(peer);
        sink.closed.notified().await;
        assert_eq!(sink.seen.lock().unwrap().clone(), vec!["reply".to_string()]);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn close_ends_the_task_while_the_peer_lives() {
        let (handle, peer) = WindowHandle::pair("editor-3");
        let sink = Arc::new(Sink::default());
        let transport = WindowTransport::spawn(handle, sink.clone());

        transport.close();
        sink.closed.notified().await;
        assert!(!transport.is_open());
        assert_eq!(
            transport.send(Channel::External, "late".into()).await,
            Err(TransportError::Closed)
        );
        drop(peer);
    }
}
