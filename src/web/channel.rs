//! Messages between the web handlers and the host task.

use serde_json::{Map, Value};
use tokio::sync::oneshot;

/// A request sent from a web handler to the host task.
#[derive(Debug)]
pub enum HostRequest {
    /// Run one command line; the reply is the text shown to the user.
    ExecuteGcode {
        command: String,
        respond_to: oneshot::Sender<Result<String, String>>,
    },
    QueryObjects {
        objects: Vec<String>,
        respond_to: oneshot::Sender<Map<String, Value>>,
    },
    ListObjects {
        respond_to: oneshot::Sender<Vec<String>>,
    },
}
