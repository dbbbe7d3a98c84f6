//! Host-facing operations. The host decides when these run and what happens to
//! the results; permission checks for the admin listing are also the host's.

use serde::Serialize;

use crate::device::{ConnectionManager, ConnectionState, DeviceError, Endpoint, HandleInfo, TransportKind};
use crate::sensor::{AnalogFrame, EnvironmentReading};
use crate::service::ReadingService;
use crate::transport::{AnalogLink, Connector, ReportLink};

/// Produce one environment reading from the HID board
pub async fn produce_environment_reading<S, H>(
    service: &ReadingService<S, H>,
) -> Result<EnvironmentReading, DeviceError>
where
    S: Connector,
    S::Link: AnalogLink,
    H: Connector,
    H::Link: ReportLink,
{
    service.request_environment_reading().await.map_err(|e| {
        log::error!("Failed to produce environment reading: {}", e);
        e
    })
}

/// Produce one analog frame from the serial board
pub async fn produce_analog_frame<S, H>(
    service: &ReadingService<S, H>,
) -> Result<AnalogFrame, DeviceError>
where
    S: Connector,
    S::Link: AnalogLink,
    H: Connector,
    H::Link: ReportLink,
{
    service.request_analog_frame().await.map_err(|e| {
        log::error!("Failed to produce analog frame: {}", e);
        e
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointListing {
    pub kind: TransportKind,
    pub state: ConnectionState,
    pub current: Option<HandleInfo>,
    pub endpoints: Vec<Endpoint>,
}

/// Enumerated endpoints of one transport kind as structured data.
///
/// Read-only: enumeration never touches the current handle.
pub async fn endpoint_listing<C: Connector>(
    manager: &ConnectionManager<C>,
) -> Result<serde_json::Value, DeviceError> {
    let endpoints = manager.list_endpoints().await?;
    let listing = EndpointListing {
        kind: manager.kind(),
        state: manager.state(),
        current: manager.current(),
        endpoints,
    };
    Ok(serde_json::to_value(&listing)?)
}
