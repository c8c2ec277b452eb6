//! Test doubles shared by the unit tests

use async_trait::async_trait;
use backhaul_proto::TunnelMessage;
use backhaul_transport::{MessageSender, TransportResult};

/// A sender whose sink never drains, like a half-open TCP connection
#[derive(Debug, Default)]
pub(crate) struct StalledSender;

#[async_trait]
impl MessageSender for StalledSender {
    async fn send(&self, _message: &TunnelMessage) -> TransportResult<()> {
        std::future::pending().await
    }

    async fn close(&self) {
        std::future::pending::<()>().await
    }
}
