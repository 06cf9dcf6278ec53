//! Out-of-band input status notifications.

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::broadcast;

/// Type tag carried by every notification.
pub const INPUT_TYPE: &str = "linuxdvb";

const STATUS_CAPACITY: usize = 256;

/// Periodic frontend status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputStatus {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Active multiplex, if any.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub muxes: Vec<MuxStatus>,
    /// Bytes read since the previous notification.
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MuxStatus {
    pub name: String,
    pub bytes: u64,
}

impl InputStatus {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub fn channel() -> broadcast::Sender<InputStatus> {
    broadcast::channel(STATUS_CAPACITY).0
}

/// Log every notification until the channel closes.
pub async fn log_status(mut rx: broadcast::Receiver<InputStatus>) {
    loop {
        match rx.recv().await {
            Ok(status) => debug!("input {}", status.to_json()),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Status logger lagged, {} notifications dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
