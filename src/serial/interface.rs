use std::time::Duration;

use serialport::{SerialPort, SerialPortInfo, SerialPortType};

use crate::config::SerialConfig;
use crate::device::{Endpoint, TransportKind};
use crate::transport::Result;

/// Default StandardFirmata baud rate
pub const FIRMATA_BAUD_RATE: u32 = 57_600;

/// Serial port discovery and opening
pub struct SerialInterface;

impl SerialInterface {
    /// List ports that look like Firmata boards, in enumeration order
    pub fn discover_ports(config: &SerialConfig) -> Result<Vec<Endpoint>> {
        let ports = serialport::available_ports()?;
        let endpoints: Vec<Endpoint> = ports
            .iter()
            .filter(|port| Self::accepts(config, port))
            .map(Self::endpoint_for)
            .collect();
        log::debug!("Found {} candidate serial ports", endpoints.len());
        Ok(endpoints)
    }

    /// Open `port_name` with a short read timeout so the reader thread can poll.
    pub fn open(port_name: &str, config: &SerialConfig) -> Result<Box<dyn SerialPort>> {
        let port = serialport::new(port_name, config.baud_rate)
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .open()?;
        log::info!("Opened serial port {} at {} baud", port_name, config.baud_rate);
        Ok(port)
    }

    fn accepts(config: &SerialConfig, port: &SerialPortInfo) -> bool {
        let usb_ids = match &port.port_type {
            SerialPortType::UsbPort(usb) => Some((usb.vid, usb.pid)),
            _ => None,
        };
        accepts_port(config, &port.port_name, usb_ids)
    }

    fn endpoint_for(port: &SerialPortInfo) -> Endpoint {
        let mut endpoint = Endpoint::new(TransportKind::Serial, port.port_name.clone());
        if let SerialPortType::UsbPort(usb) = &port.port_type {
            endpoint = endpoint.with_usb_ids(usb.vid, usb.pid);
            endpoint.serial_number = usb.serial_number.clone();
            endpoint.manufacturer = usb.manufacturer.clone();
            endpoint.product = usb.product.clone();
        }
        endpoint
    }
}

/// With a vid/pid filter only matching USB ports pass; otherwise any USB port or
/// a port whose name matches one of the configured patterns.
fn accepts_port(config: &SerialConfig, port_name: &str, usb_ids: Option<(u16, u16)>) -> bool {
    if config.vid.is_some() || config.pid.is_some() {
        return usb_ids.is_some_and(|(vid, pid)| {
            config.vid.map_or(true, |v| v == vid) && config.pid.map_or(true, |p| p == pid)
        });
    }
    usb_ids.is_some() || matches_name(&config.name_patterns, port_name)
}

fn matches_name(patterns: &[String], port_name: &str) -> bool {
    patterns.iter().any(|pattern| port_name.contains(pattern.as_str()))
}
