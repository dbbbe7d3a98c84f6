use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::hid::{SLT_PID, SLT_VID};
use crate::sensor::{AnalogReadMode, CommandCode};
use crate::serial::FIRMATA_BAUD_RATE;
use crate::transport::MAX_ANALOG_PINS;

/// Runtime settings. Every field has a default, so a partial JSON document
/// (or `{}`) is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionConfig,
    pub serial: SerialConfig,
    pub hid: HidConfig,
    pub sensor: SensorSettings,
}

impl Settings {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let settings: Settings = serde_json::from_str(json).context("Invalid settings JSON")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Failed to load {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection.connect_timeout_ms == 0 {
            bail!("connection.connect_timeout_ms must be greater than zero");
        }
        if self.sensor.analog_channels as usize > MAX_ANALOG_PINS {
            bail!(
                "sensor.analog_channels is {} but at most {} analog pins are addressable",
                self.sensor.analog_channels,
                MAX_ANALOG_PINS
            );
        }
        if self.serial.baud_rate == 0 {
            bail!("serial.baud_rate must be greater than zero");
        }
        Ok(())
    }
}

/// Connection lifecycle tuning shared by both transports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on the wait for a freshly opened transport to report ready
    pub connect_timeout_ms: u64,
    /// Bound on a best-effort close of a retired or abandoned link
    pub close_timeout_ms: u64,
    /// Number of retired handles kept referenced
    pub retired_history: usize,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            close_timeout_ms: 2_000,
            retired_history: 8,
        }
    }
}

/// Serial (Firmata) board discovery and link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// Restrict discovery to this USB vendor id
    pub vid: Option<u16>,
    /// Restrict discovery to this USB product id
    pub pid: Option<u16>,
    /// Port name fragments accepted when no vid/pid filter is set
    pub name_patterns: Vec<String>,
    /// Poll interval of the background reader
    pub read_timeout_ms: u64,
    /// Interval between version requests until the board answers
    pub version_request_interval_ms: u64,
    /// Analog sampling interval pushed to the board once ready; firmware default when unset
    pub sampling_interval_ms: Option<u16>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: FIRMATA_BAUD_RATE,
            vid: None,
            pid: None,
            name_patterns: vec![
                "usbserial".to_string(),
                "usbmodem".to_string(),
                "ttyACM".to_string(),
                "ttyUSB".to_string(),
                "COM".to_string(),
            ],
            read_timeout_ms: 100,
            version_request_interval_ms: 1_000,
            sampling_interval_ms: None,
        }
    }
}

/// SLT HID board discovery and I/O settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HidConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Bound on the wait for a response report
    pub read_timeout_ms: u64,
}

impl Default for HidConfig {
    fn default() -> Self {
        Self {
            vendor_id: SLT_VID,
            product_id: SLT_PID,
            read_timeout_ms: 2_000,
        }
    }
}

/// What to do when a request arrives while another is in flight on the same handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPolicy {
    #[default]
    Queue,
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Analog channels read per frame, starting at A0
    pub analog_channels: u8,
    pub analog_mode: AnalogReadMode,
    /// Command sent for environment readings
    pub environment_command: CommandCode,
    pub request_policy: RequestPolicy,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            analog_channels: 6,
            analog_mode: AnalogReadMode::Cached,
            environment_command: CommandCode::TempLight,
            request_policy: RequestPolicy::Queue,
        }
    }
}
