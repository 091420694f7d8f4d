//! Outbound message transport: the "send a message to a phone" capability.

pub mod http;

pub use http::HttpSender;

use async_trait::async_trait;
use tracing::info;

use crate::error::SendError;

/// Abstract send capability. May be slow and may fail transiently.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Deliver `body` to `phone`.
    async fn send(&self, phone: &str, body: &str) -> Result<(), SendError>;

    /// Check the transport is reachable. `Fatal` means it is gone.
    async fn health_check(&self) -> Result<(), SendError> {
        Ok(())
    }
}

/// Logs every message and reports success. Used when no gateway is configured.
#[derive(Debug, Default)]
pub struct LogSender;

#[async_trait]
impl MessageSender for LogSender {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, phone: &str, body: &str) -> Result<(), SendError> {
        info!(
            phone = %phone,
            body = %body.chars().take(100).collect::<String>(),
            "Message delivered (log transport)"
        );
        Ok(())
    }
}
