// ino_simulator: in-memory INO board for tests, benches and --simulate runs

pub mod board;
pub mod thermal;

pub use board::{BoardState, SimControls, FIRMWARE_VERSION};
pub use thermal::ThermalModel;

use async_trait::async_trait;
use ino_shared::Connector;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const DUPLEX_CAPACITY: usize = 4096;
const GENERATION_POLL: Duration = Duration::from_millis(10);

/// A connector that hands out in-memory links to one simulated board.
///
/// Clones share the board and its controls, so a test keeps one handle while
/// the host owns another.
#[derive(Debug, Clone)]
pub struct SimConnector {
    name: String,
    board: Arc<Mutex<BoardState>>,
    controls: Arc<SimControls>,
}

impl SimConnector {
    pub fn new(name: impl Into<String>, model: ThermalModel) -> Self {
        Self {
            name: name.into(),
            board: Arc::new(Mutex::new(BoardState::new(model))),
            controls: Arc::new(SimControls::default()),
        }
    }

    pub fn hotend(name: impl Into<String>) -> Self {
        Self::new(name, ThermalModel::hotend())
    }

    pub fn controls(&self) -> &SimControls {
        &self.controls
    }

    /// Locked view of the board, for assertions and fixtures.
    pub fn board(&self) -> MutexGuard<'_, BoardState> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for SimConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        if self.controls.is_offline() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("{} is unplugged", self.name)));
        }
        self.controls.record_connect();
        let (host_side, board_side) = tokio::io::duplex(DUPLEX_CAPACITY);
        tokio::spawn(serve(board_side, self.board.clone(), self.controls.clone()));
        Ok(host_side)
    }

    fn describe(&self) -> String {
        format!("sim:{}", self.name)
    }
}

/// Board side of one link. Ends when the host hangs up or the link generation
/// moves on.
async fn serve(mut stream: DuplexStream, board: Arc<Mutex<BoardState>>, controls: Arc<SimControls>) {
    let generation = controls.generation();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 256];
    let mut poll = tokio::time::interval(GENERATION_POLL);

    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == 0) {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let frame = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
                    let replies = {
                        let mut board = board.lock().unwrap_or_else(PoisonError::into_inner);
                        board.handle(&frame, &controls)
                    };
                    if replies.is_empty() {
                        continue;
                    }
                    let mut out = Vec::new();
                    if controls.garbage() {
                        out.extend_from_slice(&[0xff, 0xfe, 0x00]);
                    }
                    for reply in replies {
                        out.extend_from_slice(reply.as_bytes());
                        out.push(0);
                    }
                    if stream.write_all(&out).await.is_err() {
                        return;
                    }
                }
            }
            _ = poll.tick() => {
                if controls.generation() != generation {
                    tracing::debug!("simulated link dropped");
                    return;
                }
            }
        }
    }
}
