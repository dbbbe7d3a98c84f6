use std::sync::Arc;

use crate::config::{RequestPolicy, SensorSettings, Settings};
use crate::device::handle::LinkGuard;
use crate::device::{ConnectionManager, DeviceError, DeviceHandle, Result};
use crate::hid::HidConnector;
use crate::sensor::{
    decode_environment_response, encode_request, read_analog_frame, AnalogFrame, CommandCode,
    EnvironmentReading, REPORT_SIZE,
};
use crate::serial::FirmataConnector;
use crate::transport::{AnalogLink, Connector, DeviceLink, ReportLink};

/// Answers "read now" requests against the serial and HID boards.
///
/// Each request acquires the current handle of its transport (connecting on
/// demand), holds the handle's link for the whole exchange and, when the
/// exchange leaves the link in an unknown state, retires the handle before
/// returning the error so the next request probes afresh.
pub struct ReadingService<S: Connector, H: Connector> {
    serial: Arc<ConnectionManager<S>>,
    hid: Arc<ConnectionManager<H>>,
    settings: SensorSettings,
}

/// The service wired to real hardware
pub type SensorService = ReadingService<FirmataConnector, HidConnector>;

impl SensorService {
    pub fn from_settings(settings: &Settings) -> Self {
        let serial = ConnectionManager::new(
            FirmataConnector::new(settings.serial.clone(), settings.sensor.analog_channels),
            settings.connection.clone(),
        );
        let hid = ConnectionManager::new(
            HidConnector::new(settings.hid.clone()),
            settings.connection.clone(),
        );
        Self::new(Arc::new(serial), Arc::new(hid), settings.sensor.clone())
    }
}

impl<S, H> ReadingService<S, H>
where
    S: Connector,
    S::Link: AnalogLink,
    H: Connector,
    H::Link: ReportLink,
{
    pub fn new(
        serial: Arc<ConnectionManager<S>>,
        hid: Arc<ConnectionManager<H>>,
        settings: SensorSettings,
    ) -> Self {
        Self {
            serial,
            hid,
            settings,
        }
    }

    pub fn serial(&self) -> &Arc<ConnectionManager<S>> {
        &self.serial
    }

    pub fn hid(&self) -> &Arc<ConnectionManager<H>> {
        &self.hid
    }

    pub fn settings(&self) -> &SensorSettings {
        &self.settings
    }

    /// Read the environment sensors with the configured command.
    pub async fn request_environment_reading(&self) -> Result<EnvironmentReading> {
        self.request_environment_reading_with(self.settings.environment_command)
            .await
    }

    pub async fn request_environment_reading_with(
        &self,
        command: CommandCode,
    ) -> Result<EnvironmentReading> {
        let handle = self.hid.acquire().await?;
        let result = self.exchange(&handle, command).await;
        if let Err(e) = &result {
            if e.retires_handle() {
                log::warn!("Environment request on HID handle {} failed: {}", handle.id(), e);
                self.hid.on_disconnect(handle.id());
            }
        }
        result
    }

    /// Sample analog pins `0..analog_channels` of the serial board.
    pub async fn request_analog_frame(&self) -> Result<AnalogFrame> {
        let handle = self.serial.acquire().await?;
        let result = self.sample(&handle).await;
        // A missing fresh sample is not a link fault; only transport errors retire.
        if let Err(e @ DeviceError::Transport(_)) = &result {
            log::warn!("Analog request on serial handle {} failed: {}", handle.id(), e);
            self.serial.on_disconnect(handle.id());
        }
        result
    }

    /// Close both boards. Never fails.
    pub async fn shutdown(&self) {
        log::info!("Shutting down reading service");
        tokio::join!(self.serial.close(), self.hid.close());
    }

    async fn exchange(
        &self,
        handle: &DeviceHandle<H::Link>,
        command: CommandCode,
    ) -> Result<EnvironmentReading> {
        let mut link = self.lock(handle).await?;
        link.write_report(&encode_request(command)).await?;
        let mut response = [0u8; REPORT_SIZE];
        let len = link.read_report(&mut response).await?;
        drop(link);
        let reading = decode_environment_response(&response[..len])?.for_command(command);
        log::debug!(
            "Environment reading: {:.2} C, secondary {:.1} ({:?})",
            reading.celsius,
            reading.secondary,
            reading.quantity
        );
        Ok(reading)
    }

    async fn sample(&self, handle: &DeviceHandle<S::Link>) -> Result<AnalogFrame> {
        let link = self.lock(handle).await?;
        let frame = read_analog_frame(&*link, self.settings.analog_channels, self.settings.analog_mode);
        drop(link);
        frame.await
    }

    async fn lock<'a, L: DeviceLink>(&self, handle: &'a DeviceHandle<L>) -> Result<LinkGuard<'a, L>> {
        match self.settings.request_policy {
            RequestPolicy::Queue => handle.lock().await,
            RequestPolicy::FailFast => handle.try_lock(),
        }
    }
}
