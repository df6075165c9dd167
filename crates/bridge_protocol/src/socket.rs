//! WebSocket transport to a backend process.
//!
//! One task owns the socket: it forwards queued outbound frames and hands
//! every inbound text frame to the [`FrameSink`]. When the socket closes the
//! sink is told once through `on_disconnect`.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMsg};
use tracing::{debug, info, warn};

use crate::transport::{Channel, FrameSink, SocketFrame, Transport, TransportError};

pub struct SocketTransport {
    url: String,
    tx: UnboundedSender<WsMsg>,
    open: Arc<AtomicBool>,
    threshold: usize,
}

impl SocketTransport {
    /// Connect to `url` and start pumping frames into `sink`.
    pub async fn connect(
        url: &str,
        threshold: usize,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Arc<Self>, TransportError> {
        let (ws_stream, _) = connect_async(url).await.map_err(|e| TransportError::Connect {
            url: url.to_owned(),
            reason: e.to_string(),
        })?;
        info!(%url, "socket connected");

        let (mut write, mut read) = ws_stream.split();
        let (tx_out, mut rx_out) = unbounded_channel::<WsMsg>();
        let open = Arc::new(AtomicBool::new(true));

        let task_open = open.clone();
        let task_url = url.to_owned();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // inbound
                    msg = read.next() => match msg {
                        Some(Ok(WsMsg::Text(txt))) => {
                            match serde_json::from_str::<SocketFrame>(&txt.to_string()) {
                                Ok(frame) => sink.handle_frame(frame.channel, frame.payload).await,
                                Err(e) => warn!(url = %task_url, "dropping malformed socket frame: {e}"),
                            }
                        }
                        Some(Ok(WsMsg::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(url = %task_url, "socket read error: {e}");
                            break;
                        }
                    },
                    // outbound
                    frame = rx_out.recv() => match frame {
                        Some(WsMsg::Close(c)) => {
                            let _ = write.send(WsMsg::Close(c)).await;
                            break;
                        }
                        Some(frame) => {
                            if let Err(e) = write.send(frame).await {
                                warn!(url = %task_url, "socket write error: {e}");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            task_open.store(false, Ordering::SeqCst);
            debug!(url = %task_url, "socket closed");
            sink.on_disconnect();
        });

        Ok(Arc::new(Self {
            url: url.to_owned(),
            tx: tx_out,
            open,
            threshold,
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Ask the socket task to close the connection.
    pub fn close(&self) {
        if self.open.load(Ordering::SeqCst) {
            let _ = self.tx.send(WsMsg::Close(None));
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn send(&self, channel: Channel, payload: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let text = serde_json::to_string(&SocketFrame { channel, payload })
            .map_err(|e| TransportError::Send(e.to_string()))?;
        self.tx
            .send(WsMsg::Text(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    fn max_message_size(&self) -> Option<usize> {
        Some(self.threshold)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn describe(&self) -> String {
        format!("socket {}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio::sync::Notify;
    use tokio_tungstenite::accept_async;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<(Channel, String)>>,
        gone: Notify,
        got: Notify,
    }

    #[async_trait]
    impl FrameSink for Recorder {
        async fn handle_frame(&self, channel: Channel, text: String) {
            self.frames.lock().unwrap().push((channel, text));
            self.got.notify_one();
        }
        fn on_disconnect(&self) {
            self.gone.notify_one();
        }
    }

    #[tokio::test]
    async fn frames_travel_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // echo server that swaps the channel
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(Ok(WsMsg::Text(txt))) = ws.next().await {
                let mut frame: SocketFrame = serde_json::from_str(&txt.to_string()).unwrap();
                frame.channel = Channel::External;
                let reply = serde_json::to_string(&frame).unwrap();
                ws.send(WsMsg::Text(reply.into())).await.unwrap();
            }
            let _ = ws.close(None).await;
        });

        let sink = Arc::new(Recorder::default());
        let transport = SocketTransport::connect(&format!("ws://{addr}"), 64, sink.clone())
            .await
            .unwrap();
        assert_eq!(transport.max_message_size(), Some(64));
        transport.send(Channel::Backend, "{\"a\":1}".into()).await.unwrap();

        sink.got.notified().await;
        assert_eq!(
            sink.frames.lock().unwrap().clone(),
            vec![(Channel::External, "{\"a\":1}".to_string())]
        );

        sink.gone.notified().await;
        assert!(!transport.is_open());
        assert_eq!(
            transport.send(Channel::Backend, "{}".into()).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let sink = Arc::new(Recorder::default());
        let err = SocketTransport::connect("ws://127.0.0.1:1", 64, sink).await;
        assert!(matches!(err, Err(TransportError::Connect { .. })));
    }
}
