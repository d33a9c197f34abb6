// src/link/mod.rs - Serial session to one INO board
pub mod frame;
pub mod protocol;
pub mod serial;

pub use frame::{encode_frame, FrameDecoder, FrameError};
pub use protocol::{DeviceCommand, DeviceFlags, Inbound, ProtocolError, Telemetry};
pub use serial::SerialConnector;

use ino_shared::Connector;
use serde::Serialize;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::Instant;

const READ_CHUNK: usize = 256;
const CONSOLE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link to {port} unavailable: {source}")]
    LinkUnavailable {
        port: String,
        #[source]
        source: io::Error,
    },
    #[error("no telemetry within {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    MalformedResponse(#[from] ProtocolError),
    #[error("link lost: {0}")]
    LinkLost(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Faulted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub connects: u64,
    pub reconnects: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_discarded: u64,
    pub timeouts: u64,
}

/// Owns the byte stream to one board.
///
/// Not shared: exactly one task (the sensor's sampler) drives it. Every public
/// operation makes at most one connection attempt when the session is closed
/// or faulted.
pub struct LinkManager<C: Connector> {
    connector: C,
    port: String,
    timeout: Duration,
    state: SessionState,
    stream: Option<C::Stream>,
    decoder: FrameDecoder,
    last_activity: Option<Instant>,
    stats: LinkStats,
    console: broadcast::Sender<String>,
}

impl<C: Connector> LinkManager<C> {
    /// `timeout` bounds every telemetry request; callers pass the report interval.
    pub fn new(connector: C, timeout: Duration) -> Self {
        let port = connector.describe();
        let (console, _) = broadcast::channel(CONSOLE_CAPACITY);
        Self {
            connector,
            port,
            timeout,
            state: SessionState::Closed,
            stream: None,
            decoder: FrameDecoder::new(),
            last_activity: None,
            stats: LinkStats::default(),
            console,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open && self.stream.is_some()
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// Unsolicited board output: device errors and console lines.
    pub fn subscribe_console(&self) -> broadcast::Receiver<String> {
        self.console.subscribe()
    }

    /// Sender side of the console channel, for handing out subscriptions
    /// after the manager moved into its task.
    pub fn console(&self) -> broadcast::Sender<String> {
        self.console.clone()
    }

    pub async fn open(&mut self) -> Result<(), LinkError> {
        self.state = SessionState::Opening;
        match self.connector.connect().await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.decoder.clear();
                self.state = SessionState::Open;
                self.last_activity = Some(Instant::now());
                if self.stats.connects > 0 {
                    self.stats.reconnects += 1;
                }
                self.stats.connects += 1;
                tracing::info!("INO link {} open", self.port);
                Ok(())
            }
            Err(source) => {
                self.state = SessionState::Closed;
                tracing::error!("Unable to open INO link {}: {}", self.port, source);
                Err(LinkError::LinkUnavailable {
                    port: self.port.clone(),
                    source,
                })
            }
        }
    }

    async fn ensure_open(&mut self) -> Result<(), LinkError> {
        if self.is_open() {
            return Ok(());
        }
        self.open().await
    }

    /// Write one frame without waiting for an answer.
    pub async fn send(&mut self, text: &str) -> Result<(), LinkError> {
        self.ensure_open().await?;
        self.write_frame(text).await
    }

    async fn write_frame(&mut self, text: &str) -> Result<(), LinkError> {
        let bytes = encode_frame(text);
        let written = match self.stream.as_mut() {
            Some(stream) => match stream.write_all(&bytes).await {
                Ok(()) => stream.flush().await,
                Err(e) => Err(e),
            },
            None => Err(io::ErrorKind::NotConnected.into()),
        };
        match written {
            Ok(()) => {
                self.stats.frames_sent += 1;
                tracing::debug!("INO <- {}", text);
                Ok(())
            }
            Err(e) => Err(self.lose(e)),
        }
    }

    /// Query telemetry and wait, at most the configured timeout, for the reply.
    ///
    /// Frames that arrive meanwhile and are not telemetry go to the console
    /// channel. A timeout or unparseable telemetry faults the session.
    pub async fn request_telemetry(&mut self) -> Result<Telemetry, LinkError> {
        self.ensure_open().await?;
        self.write_frame(&DeviceCommand::QueryTelemetry.to_string()).await?;
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; READ_CHUNK];

        loop {
            while let Some(frame) = self.decoder.next_frame() {
                let text = match frame {
                    Ok(text) => text,
                    Err(e) => {
                        self.stats.frames_discarded += 1;
                        tracing::debug!("INO {} dropped a frame: {}", self.port, e);
                        continue;
                    }
                };
                self.stats.frames_received += 1;
                self.last_activity = Some(Instant::now());
                tracing::debug!("INO -> {}", text);
                if protocol::is_telemetry(&text) {
                    return match protocol::parse_telemetry(&text) {
                        Ok(telemetry) => Ok(telemetry),
                        Err(e) => {
                            self.fault(&e.to_string());
                            Err(LinkError::MalformedResponse(e))
                        }
                    };
                }
                self.publish_unsolicited(text);
            }

            let read = match self.stream.as_mut() {
                Some(stream) => tokio::time::timeout_at(deadline, stream.read(&mut buf)).await,
                None => return Err(self.lose(io::ErrorKind::NotConnected.into())),
            };
            match read {
                Err(_) => {
                    self.stats.timeouts += 1;
                    self.fault("telemetry timeout");
                    return Err(LinkError::Timeout(self.timeout));
                }
                Ok(Ok(0)) => return Err(self.lose(io::ErrorKind::UnexpectedEof.into())),
                Ok(Ok(n)) => self.decoder.push(&buf[..n]),
                Ok(Err(e)) => return Err(self.lose(e)),
            }
        }
    }

    fn publish_unsolicited(&mut self, text: String) {
        match protocol::classify(&text) {
            Ok(Inbound::DeviceError(line)) => tracing::warn!("INO {} reported: {}", self.port, line),
            _ => tracing::info!("Output from INO {}: {}", self.port, text),
        }
        // Nobody listening is fine.
        let _ = self.console.send(text);
    }

    fn fault(&mut self, reason: &str) {
        tracing::warn!("INO link {} faulted: {}", self.port, reason);
        self.stream = None;
        self.state = SessionState::Faulted;
    }

    fn lose(&mut self, err: io::Error) -> LinkError {
        tracing::error!("INO link {} lost: {}", self.port, err);
        self.stream = None;
        self.state = SessionState::Faulted;
        LinkError::LinkLost(err)
    }

    /// Close the session. Safe to call in any state.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            tracing::info!("INO link {} closed", self.port);
        }
        self.state = SessionState::Closed;
    }
}
