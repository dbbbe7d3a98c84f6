use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical channel used to reach a board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Hid,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => f.write_str("serial"),
            TransportKind::Hid => f.write_str("HID"),
        }
    }
}

/// Creation sequence number of a device handle, unique per manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of the current-handle slot of one transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Absent,
    Connecting,
    Ready,
    Retiring,
}

/// A candidate physical endpoint reported by enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Serial port name or HID device path, captured at enumeration time
    pub id: String,
    pub kind: TransportKind,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl Endpoint {
    pub fn new(kind: TransportKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }

    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }

    /// Vendor/product signature, when the endpoint is a USB device
    pub fn signature(&self) -> Option<(u16, u16)> {
        self.vid.zip(self.pid)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signature() {
            Some((vid, pid)) => write!(f, "{} ({:04X}:{:04X})", self.id, vid, pid),
            None => f.write_str(&self.id),
        }
    }
}

/// Serializable snapshot of a device handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleInfo {
    pub id: HandleId,
    pub kind: TransportKind,
    pub endpoint: Endpoint,
    pub open: bool,
    pub created_at: DateTime<Utc>,
}
