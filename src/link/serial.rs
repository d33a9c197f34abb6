use async_trait::async_trait;
use ino_shared::Connector;
use serial2_tokio::SerialPort;

/// Opens the INO board's serial port.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    baud: u32,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self { path: path.into(), baud }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    type Stream = SerialPort;

    async fn connect(&self) -> std::io::Result<SerialPort> {
        tracing::info!("Opening INO serial port {} at {} baud", self.path, self.baud);
        SerialPort::open(&self.path, self.baud)
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}
