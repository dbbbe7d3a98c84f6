use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serialport::SerialPort;
use tokio::sync::watch;

use super::protocol::{self, FirmataMessage, FirmataParser};
use crate::transport::{AnalogLink, AnalogSamples, DeviceLink, EventSink, Result, TransportError};

/// Open serial connection to a Firmata board.
///
/// A background thread owns a clone of the port, decodes everything the board
/// sends and keeps the latest analog sample per pin. It raises `Ready` on the
/// first version report and `Closed` when the port fails.
pub struct FirmataLink {
    port: Arc<StdMutex<Box<dyn SerialPort>>>,
    port_name: String,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    samples: watch::Sender<AnalogSamples>,
    version: Arc<StdMutex<Option<(u8, u8)>>>,
}

impl FirmataLink {
    /// Start the reader thread on `port` and ask the board for its version.
    pub fn start(
        mut port: Box<dyn SerialPort>,
        port_name: &str,
        version_request_interval: Duration,
        events: EventSink,
    ) -> Result<Self> {
        let reader_port = port.try_clone()?;
        let running = Arc::new(AtomicBool::new(true));
        let (samples, _) = watch::channel(AnalogSamples::default());
        let version = Arc::new(StdMutex::new(None));

        port.write_all(&protocol::request_version())?;
        port.flush()?;

        let reader = {
            let running = running.clone();
            let samples = samples.clone();
            let version = version.clone();
            let port_name = port_name.to_string();
            thread::Builder::new()
                .name(format!("firmata-{}", events.handle()))
                .spawn(move || {
                    read_loop(
                        reader_port,
                        &port_name,
                        version_request_interval,
                        &running,
                        &samples,
                        &version,
                        &events,
                    )
                })?
        };

        Ok(Self {
            port: Arc::new(StdMutex::new(port)),
            port_name: port_name.to_string(),
            running,
            reader: Some(reader),
            samples,
            version,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Firmata protocol version reported by the board
    pub fn version(&self) -> Option<(u8, u8)> {
        *self.version.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write `bytes` to the board on the blocking pool.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        let port = self.port.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut port = port.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            port.write_all(&bytes)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| TransportError::Task(e.to_string()))?
    }

    /// Mode-set: turn on continuous reporting for analog pins `0..channels`.
    pub async fn enable_analog_reporting(&self, channels: u8, sampling_interval_ms: Option<u16>) -> Result<()> {
        self.send(mode_set(channels, sampling_interval_ms)).await?;
        log::info!("Enabled analog reporting for {} channels on {}", channels, self.port_name);
        Ok(())
    }
}

#[async_trait]
impl DeviceLink for FirmataLink {
    async fn close(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            log::debug!("Joining Firmata reader thread for {}", self.port_name);
            tokio::task::spawn_blocking(move || reader.join())
                .await
                .map_err(|e| TransportError::Task(e.to_string()))?
                .map_err(|_| TransportError::Task("Firmata reader thread panicked".to_string()))?;
        }
        log::info!("Closed serial port {}", self.port_name);
        Ok(())
    }
}

impl AnalogLink for FirmataLink {
    fn analog_samples(&self) -> watch::Receiver<AnalogSamples> {
        self.samples.subscribe()
    }
}

impl Drop for FirmataLink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Sampling interval (when set) followed by one `REPORT_ANALOG` enable per pin
fn mode_set(channels: u8, sampling_interval_ms: Option<u16>) -> Vec<u8> {
    let mut commands = Vec::new();
    if let Some(interval) = sampling_interval_ms {
        commands.extend_from_slice(&protocol::sampling_interval(interval));
    }
    for pin in 0..channels {
        commands.extend_from_slice(&protocol::report_analog(pin, true));
    }
    commands
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    port_name: &str,
    version_request_interval: Duration,
    running: &AtomicBool,
    samples: &watch::Sender<AnalogSamples>,
    version: &StdMutex<Option<(u8, u8)>>,
    events: &EventSink,
) {
    let mut parser = FirmataParser::new();
    let mut buf = [0u8; 256];
    let mut ready = false;
    let mut last_request = Instant::now();

    while running.load(Ordering::SeqCst) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for message in parser.feed(&buf[..n]) {
                    match message {
                        FirmataMessage::Analog { pin, value } => {
                            samples.send_modify(|s| s.record(pin, value));
                        }
                        FirmataMessage::Version { major, minor } => {
                            *version.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                                Some((major, minor));
                            if !ready {
                                ready = true;
                                log::info!("Firmata {}.{} board ready on {}", major, minor, port_name);
                                let _ = port.write_all(&protocol::request_firmware());
                                events.ready();
                            }
                        }
                        ref sysex @ FirmataMessage::Sysex { .. } => {
                            if let Some(name) = sysex.firmware_name() {
                                log::info!("Board firmware on {}: {}", port_name, name);
                            }
                        }
                        FirmataMessage::Digital { .. } => {}
                    }
                }
            }
            Err(ref e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    log::warn!("Serial port {} failed: {}", port_name, e);
                    events.closed(e.to_string());
                }
                break;
            }
        }

        // The board may still be in its bootloader when the port opens.
        if !ready && last_request.elapsed() >= version_request_interval {
            last_request = Instant::now();
            if let Err(e) = port.write_all(&protocol::request_version()) {
                log::warn!("Version request on {} failed: {}", port_name, e);
            }
        }
    }
    log::debug!("Firmata reader thread exiting ({})", port_name);
}
