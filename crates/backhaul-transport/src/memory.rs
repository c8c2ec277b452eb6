//! In-process channel pair
//!
//! Frames still pass through [`TunnelCodec`] as text, so the peer sees
//! exactly what it would see over a WebSocket, including malformed frames
//! injected with [`MemorySender::send_raw`].

use async_trait::async_trait;
use backhaul_proto::{TunnelCodec, TunnelMessage};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::{Channel, MessageReceiver, MessageSender, TransportError, TransportResult};

/// One end of an in-process tunnel
#[derive(Debug)]
pub struct MemoryEnd {
    pub sender: Arc<MemorySender>,
    pub receiver: MemoryReceiver,
}

impl MemoryEnd {
    pub fn into_channel(self) -> Channel {
        Channel {
            sender: self.sender,
            receiver: Box::new(self.receiver),
        }
    }
}

/// Create two connected ends
pub fn pair() -> (MemoryEnd, MemoryEnd) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = MemoryEnd {
        sender: Arc::new(MemorySender::new(a_tx)),
        receiver: MemoryReceiver { rx: a_rx },
    };
    let b = MemoryEnd {
        sender: Arc::new(MemorySender::new(b_tx)),
        receiver: MemoryReceiver { rx: b_rx },
    };
    (a, b)
}

#[derive(Debug)]
pub struct MemorySender {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl MemorySender {
    fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Push a frame without encoding it
    pub fn send_raw(&self, frame: impl Into<String>) -> TransportResult<()> {
        let guard = self
            .tx
            .lock()
            .map_err(|_| TransportError::ConnectionLost("sender poisoned".to_string()))?;
        match guard.as_ref() {
            Some(tx) => tx
                .send(frame.into())
                .map_err(|_| TransportError::ConnectionLost("peer dropped".to_string())),
            None => Err(TransportError::ConnectionLost("channel closed".to_string())),
        }
    }
}

#[async_trait]
impl MessageSender for MemorySender {
    async fn send(&self, message: &TunnelMessage) -> TransportResult<()> {
        let frame = TunnelCodec::encode(message)?;
        self.send_raw(frame)
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

#[derive(Debug)]
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    async fn recv(&mut self) -> TransportResult<Option<TunnelMessage>> {
        match self.rx.recv().await {
            Some(frame) => Ok(Some(TunnelCodec::decode(&frame)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (a, mut b) = pair();
        let mut a_rx = a.receiver;

        a.sender.send(&TunnelMessage::Heartbeat { time: 7 }).await.unwrap();
        assert_eq!(
            b.receiver.recv().await.unwrap(),
            Some(TunnelMessage::Heartbeat { time: 7 })
        );

        b.sender
            .send(&TunnelMessage::Ping {
                id: "p1".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            a_rx.recv().await.unwrap(),
            Some(TunnelMessage::Ping { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (a, mut b) = pair();

        a.sender.close().await;

        assert!(b.receiver.recv().await.unwrap().is_none());
        let result = a.sender.send(&TunnelMessage::Heartbeat { time: 1 }).await;
        assert!(matches!(result, Err(TransportError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_channel_open() {
        let (a, mut b) = pair();

        a.sender.send_raw("{broken").unwrap();
        a.sender.send(&TunnelMessage::Heartbeat { time: 2 }).await.unwrap();

        let err = b.receiver.recv().await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(
            b.receiver.recv().await.unwrap(),
            Some(TunnelMessage::Heartbeat { time: 2 })
        );
    }
}
