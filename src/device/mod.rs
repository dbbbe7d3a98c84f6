pub mod handle;
pub mod manager;
pub mod models;

pub use handle::DeviceHandle;
pub use manager::ConnectionManager;
pub use models::*;

use std::sync::Arc;
use std::time::Duration;

use crate::transport::TransportError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("No {0} device found")]
    NoDeviceFound(TransportKind),

    #[error("Could not connect to {endpoint} within {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Transport error: {0}")]
    Transport(#[source] Arc<TransportError>),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device busy: a request is already in flight on handle {0}")]
    Busy(HandleId),

    #[error("Serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),
}

impl DeviceError {
    /// Failures that leave the handle in an unknown state and must retire it.
    pub fn retires_handle(&self) -> bool {
        matches!(self, DeviceError::Transport(_) | DeviceError::Protocol(_))
    }
}

impl From<TransportError> for DeviceError {
    fn from(err: TransportError) -> Self {
        DeviceError::Transport(Arc::new(err))
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Serialization(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
