//! WebSocket-backed channel halves

use async_trait::async_trait;
use backhaul_proto::{TunnelCodec, TunnelMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use crate::{Channel, MessageReceiver, MessageSender, TransportError, TransportResult};

/// Split an established WebSocket into a [`Channel`]
pub(crate) fn split_channel<S>(ws: WebSocketStream<S>, label: String) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    Channel {
        sender: Arc::new(WebSocketSender {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            label: label.clone(),
        }),
        receiver: Box::new(WebSocketReceiver { stream, label }),
    }
}

pub(crate) struct WebSocketSender<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    closed: AtomicBool,
    label: String,
}

impl<S> fmt::Debug for WebSocketSender<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSender")
            .field("label", &self.label)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl<S> MessageSender for WebSocketSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, message: &TunnelMessage) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost("channel closed".to_string()));
        }

        let text = TunnelCodec::encode(message)?;

        // Held for the whole frame so concurrent writers never interleave
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text)).await.map_err(|e| {
            self.closed.store(true, Ordering::SeqCst);
            TransportError::ConnectionLost(e.to_string())
        })?;

        trace!("[{}] Sent {}", self.label, message.kind());
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("[{}] Error closing WebSocket: {}", self.label, e);
        }
    }
}

pub(crate) struct WebSocketReceiver<S> {
    stream: SplitStream<WebSocketStream<S>>,
    label: String,
}

impl<S> fmt::Debug for WebSocketReceiver<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketReceiver")
            .field("label", &self.label)
            .finish()
    }
}

#[async_trait]
impl<S> MessageReceiver for WebSocketReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> TransportResult<Option<TunnelMessage>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(TunnelCodec::decode(&text)?));
                }
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8_lossy(&data);
                    return Ok(Some(TunnelCodec::decode(&text)?));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("[{}] Peer closed WebSocket: {:?}", self.label, frame);
                    return Ok(None);
                }
                // Control frames; tungstenite answers pings itself
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(TransportError::ConnectionLost(e.to_string())),
            }
        }
    }
}
