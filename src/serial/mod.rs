pub mod interface;
pub mod link;
pub mod protocol;

pub use interface::{SerialInterface, FIRMATA_BAUD_RATE};
pub use link::FirmataLink;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::SerialConfig;
use crate::device::{Endpoint, TransportKind};
use crate::transport::{Connector, EventSink, Result, TransportError};

/// Opens Firmata boards over USB serial.
///
/// The board counts as ready once it answers a version request. `prepare`
/// then switches on analog reporting for the configured channels.
pub struct FirmataConnector {
    config: SerialConfig,
    analog_channels: u8,
}

impl FirmataConnector {
    pub fn new(config: SerialConfig, analog_channels: u8) -> Self {
        Self {
            config,
            analog_channels,
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for FirmataConnector {
    type Link = FirmataLink;

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || SerialInterface::discover_ports(&config))
            .await
            .map_err(|e| TransportError::Task(e.to_string()))?
    }

    async fn open(&self, endpoint: &Endpoint, events: EventSink) -> Result<FirmataLink> {
        let config = self.config.clone();
        let port_name = endpoint.id.clone();
        tokio::task::spawn_blocking(move || {
            let port = SerialInterface::open(&port_name, &config)?;
            FirmataLink::start(
                port,
                &port_name,
                Duration::from_millis(config.version_request_interval_ms),
                events,
            )
        })
        .await
        .map_err(|e| TransportError::Task(e.to_string()))?
    }

    async fn prepare(&self, link: &mut FirmataLink) -> Result<()> {
        link.enable_analog_reporting(self.analog_channels, self.config.sampling_interval_ms)
            .await
    }
}
