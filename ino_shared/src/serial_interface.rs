use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Opens the byte stream to an external controller.
///
/// Real hardware connects through a serial port; tests and the simulator hand
/// out in-memory duplex streams. The link manager calls `connect` at most once
/// per request, so implementations must not retry internally.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> std::io::Result<Self::Stream>;

    /// Human readable endpoint, used in logs and fault messages.
    fn describe(&self) -> String;
}
