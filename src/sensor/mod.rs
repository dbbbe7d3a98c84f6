//! SLT report codec and analog frame sampling.
//!
//! The SLT board speaks fixed 64-byte reports: byte 0 selects the operation,
//! the response carries little-endian raw codes at fixed offsets.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::device::{DeviceError, Result};
use crate::transport::{AnalogLink, AnalogSamples, MAX_ANALOG_PINS};

/// Size of every report exchanged with the SLT board
pub const REPORT_SIZE: usize = 64;

/// Degrees Celsius per temperature LSB
pub const CELSIUS_PER_LSB: f64 = 0.0625;

/// Secondary channel units (lux or %RH) per LSB
pub const SECONDARY_PER_LSB: f64 = 1.2;

const TEMPERATURE_OFFSET: usize = 1;
const SECONDARY_OFFSET: usize = 3;

pub type Frame = [u8; REPORT_SIZE];

/// Operation selector sent in byte 0 of a request report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CommandCode {
    Led = 0x80,
    TempLight = 0x81,
    Temp = 0x82,
    Light = 0x83,
    Bootloader = 0x85,
    Humidity = 0x86,
    TempLightHumidity = 0x87,
}

impl CommandCode {
    pub const ALL: [CommandCode; 7] = [
        CommandCode::Led,
        CommandCode::TempLight,
        CommandCode::Temp,
        CommandCode::Light,
        CommandCode::Bootloader,
        CommandCode::Humidity,
        CommandCode::TempLightHumidity,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Quantity carried in the secondary channel of the response, if any
    pub fn secondary(self) -> Option<SecondaryQuantity> {
        match self {
            CommandCode::TempLight | CommandCode::Light | CommandCode::TempLightHumidity => {
                Some(SecondaryQuantity::Lux)
            }
            CommandCode::Humidity => Some(SecondaryQuantity::Humidity),
            CommandCode::Led | CommandCode::Temp | CommandCode::Bootloader => None,
        }
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = DeviceError;

    fn try_from(code: u8) -> Result<Self> {
        Self::from_code(code)
            .ok_or_else(|| DeviceError::Protocol(format!("Unknown command code 0x{:02X}", code)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryQuantity {
    Lux,
    Humidity,
}

/// Decoded environment report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentReading {
    pub celsius: f64,
    /// Scaled secondary channel; interpret according to `quantity`
    pub secondary: f64,
    pub quantity: Option<SecondaryQuantity>,
    pub timestamp: DateTime<Utc>,
}

impl EnvironmentReading {
    /// Interpret the secondary channel as requested by `command`.
    pub fn for_command(mut self, command: CommandCode) -> Self {
        self.quantity = command.secondary();
        self
    }

    pub fn lux(&self) -> Option<f64> {
        (self.quantity == Some(SecondaryQuantity::Lux)).then_some(self.secondary)
    }

    pub fn humidity(&self) -> Option<f64> {
        (self.quantity == Some(SecondaryQuantity::Humidity)).then_some(self.secondary)
    }
}

/// Build a request report: command in byte 0, the rest zero.
pub fn encode_request(command: CommandCode) -> Frame {
    let mut frame = [0u8; REPORT_SIZE];
    frame[0] = command.code();
    frame
}

/// Decode a response report.
///
/// The secondary quantity is taken from the command echoed in byte 0 when it is
/// recognised; callers that know what they asked for should apply
/// [`EnvironmentReading::for_command`].
pub fn decode_environment_response(frame: &[u8]) -> Result<EnvironmentReading> {
    if frame.len() != REPORT_SIZE {
        return Err(DeviceError::Protocol(format!(
            "Expected a {} byte report, got {} bytes",
            REPORT_SIZE,
            frame.len()
        )));
    }
    let raw_temperature = read_u16_le(frame, TEMPERATURE_OFFSET);
    let raw_secondary = read_u16_le(frame, SECONDARY_OFFSET);
    Ok(EnvironmentReading {
        celsius: raw_temperature as f64 * CELSIUS_PER_LSB,
        secondary: raw_secondary as f64 * SECONDARY_PER_LSB,
        quantity: CommandCode::from_code(frame[0]).and_then(CommandCode::secondary),
        timestamp: Utc::now(),
    })
}

fn read_u16_le(frame: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([frame[offset], frame[offset + 1]])
}

/// How `read_analog_frame` treats pins that have not reported yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalogReadMode {
    /// Return whatever is cached, which is zero before the first report.
    #[default]
    Cached,
    /// Wait until every requested pin has reported at least once.
    WaitForFresh { timeout_ms: u64 },
}

/// One sample per analog channel, in device-native units (10-bit ADC counts on
/// a stock Firmata board)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogFrame {
    pub samples: Vec<u16>,
    /// False if any channel had not reported yet when the frame was taken
    pub complete: bool,
    pub timestamp: DateTime<Utc>,
}

/// Collect the cached sample of analog pins `0..channels`.
///
/// Subscribes to the link's sample cache immediately; the returned future does
/// not borrow the link.
pub fn read_analog_frame<L: AnalogLink + ?Sized>(
    link: &L,
    channels: u8,
    mode: AnalogReadMode,
) -> impl Future<Output = Result<AnalogFrame>> + Send + 'static {
    collect_frame(link.analog_samples(), channels, mode)
}

async fn collect_frame(
    mut samples: watch::Receiver<AnalogSamples>,
    channels: u8,
    mode: AnalogReadMode,
) -> Result<AnalogFrame> {
    if channels as usize > MAX_ANALOG_PINS {
        return Err(DeviceError::Protocol(format!(
            "{} analog channels requested, at most {} are addressable",
            channels, MAX_ANALOG_PINS
        )));
    }

    if let AnalogReadMode::WaitForFresh { timeout_ms } = mode {
        let wait = samples.wait_for(|s| s.has_all(channels));
        match tokio::time::timeout(Duration::from_millis(timeout_ms), wait).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => {
                return Err(DeviceError::Protocol(
                    "Analog sample stream ended before every channel reported".to_string(),
                ))
            }
            Err(_) => {
                return Err(DeviceError::Protocol(format!(
                    "Not every analog channel reported within {} ms",
                    timeout_ms
                )))
            }
        }
    }

    let snapshot = samples.borrow();
    Ok(AnalogFrame {
        samples: (0..channels).map(|pin| snapshot.value(pin)).collect(),
        complete: snapshot.has_all(channels),
        timestamp: Utc::now(),
    })
}
