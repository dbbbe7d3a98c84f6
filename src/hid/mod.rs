use std::ffi::CString;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};

use async_trait::async_trait;
use hidapi::{DeviceInfo, HidApi, HidDevice};

use crate::config::HidConfig;
use crate::device::{Endpoint, TransportKind};
use crate::transport::{Connector, DeviceLink, EventSink, ReportLink, Result, TransportError};

// SLT board identifiers (Microchip VID)
pub const SLT_VID: u16 = 0x04D8;
pub const SLT_PID: u16 = 0x003F;

/// Enumerates and opens SLT boards through hidapi.
///
/// The `HidApi` context is created on first use and its device list refreshed
/// on every enumeration.
pub struct HidConnector {
    config: HidConfig,
    api: Arc<StdMutex<Option<HidApi>>>,
}

impl HidConnector {
    pub fn new(config: HidConfig) -> Self {
        Self {
            config,
            api: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn config(&self) -> &HidConfig {
        &self.config
    }

    fn refreshed_api(api: &StdMutex<Option<HidApi>>) -> Result<StdMutexGuard<'_, Option<HidApi>>> {
        let mut guard = api.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match &mut *guard {
            Some(api) => api.refresh_devices()?,
            slot @ None => *slot = Some(HidApi::new()?),
        }
        Ok(guard)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&HidApi, &HidConfig) -> Result<T> + Send + 'static,
    {
        let api = self.api.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let guard = Self::refreshed_api(&api)?;
            match guard.as_ref() {
                Some(api) => f(api, &config),
                None => Err(TransportError::Closed),
            }
        })
        .await
        .map_err(|e| TransportError::Task(e.to_string()))?
    }
}

#[async_trait]
impl Connector for HidConnector {
    type Link = HidLink;

    fn kind(&self) -> TransportKind {
        TransportKind::Hid
    }

    async fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.blocking(|api, config| {
            let mut total = 0;
            let endpoints: Vec<Endpoint> = api
                .device_list()
                .inspect(|info| {
                    total += 1;
                    log::trace!(
                        "HID device: VID=0x{:04X}, PID=0x{:04X}, path={:?}",
                        info.vendor_id(),
                        info.product_id(),
                        info.path()
                    );
                })
                .filter(|info| is_board(config, info.vendor_id(), info.product_id()))
                .map(endpoint_for)
                .collect();
            log::debug!(
                "Found {} SLT boards (VID: 0x{:04X}, PID: 0x{:04X}) among {} HID devices",
                endpoints.len(),
                config.vendor_id,
                config.product_id,
                total
            );
            Ok(endpoints)
        })
        .await
    }

    async fn open(&self, endpoint: &Endpoint, events: EventSink) -> Result<HidLink> {
        let path = endpoint.id.clone();
        let device = {
            let path = path.clone();
            self.blocking(move |api, _| {
                let c_path = CString::new(path.as_str()).map_err(|_| {
                    TransportError::Io(std::io::Error::new(
                        ErrorKind::InvalidInput,
                        format!("HID path {:?} contains a NUL byte", path),
                    ))
                })?;
                Ok(api.open_path(&c_path)?)
            })
            .await?
        };
        log::info!("Opened SLT HID board at {}", path);

        // Opening the path is all the handshake a raw HID device has.
        events.ready();
        Ok(HidLink {
            device: Arc::new(StdMutex::new(Some(device))),
            path,
            read_timeout_ms: self.config.read_timeout_ms,
            events,
        })
    }
}

fn is_board(config: &HidConfig, vendor_id: u16, product_id: u16) -> bool {
    vendor_id == config.vendor_id && product_id == config.product_id
}

fn endpoint_for(info: &DeviceInfo) -> Endpoint {
    let path = info.path().to_string_lossy().into_owned();
    let mut endpoint = Endpoint::new(TransportKind::Hid, path).with_usb_ids(info.vendor_id(), info.product_id());
    endpoint.serial_number = info.serial_number().map(str::to_string);
    endpoint.manufacturer = info.manufacturer_string().map(str::to_string);
    endpoint.product = info.product_string().map(str::to_string);
    endpoint
}

/// An open SLT board. Reports are exchanged on the blocking pool.
pub struct HidLink {
    device: Arc<StdMutex<Option<HidDevice>>>,
    path: String,
    read_timeout_ms: u64,
    events: EventSink,
}

impl HidLink {
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn with_device<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&HidDevice) -> Result<T> + Send + 'static,
    {
        let device = self.device.clone();
        let result = tokio::task::spawn_blocking(move || {
            let guard = device.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match guard.as_ref() {
                Some(device) => f(device),
                None => Err(TransportError::Closed),
            }
        })
        .await
        .map_err(|e| TransportError::Task(e.to_string()))?;

        if let Err(TransportError::Hid(e)) = &result {
            log::warn!("HID I/O on {} failed: {}", self.path, e);
            self.events.closed(e.to_string());
        }
        result
    }
}

#[async_trait]
impl DeviceLink for HidLink {
    async fn close(&mut self) -> Result<()> {
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || {
            device.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
        })
        .await
        .map_err(|e| TransportError::Task(e.to_string()))?;
        log::info!("Closed SLT HID board at {}", self.path);
        Ok(())
    }
}

#[async_trait]
impl ReportLink for HidLink {
    async fn write_report(&mut self, frame: &[u8]) -> Result<usize> {
        log::debug!("HID write {}: {}", self.path, hex::encode(frame));
        let report = frame.to_vec();
        let expected = report.len();
        let written = self.with_device(move |device| Ok(device.write(&report)?)).await?;
        if written < expected {
            return Err(TransportError::ShortWrite { written, expected });
        }
        Ok(written)
    }

    async fn read_report(&mut self, buf: &mut [u8]) -> Result<usize> {
        let timeout_ms = self.read_timeout_ms;
        let mut report = vec![0u8; buf.len()];
        let (len, report) = self
            .with_device(move |device| {
                let len = device.read_timeout(&mut report, timeout_ms.min(i32::MAX as u64) as i32)?;
                Ok((len, report))
            })
            .await?;
        if len == 0 {
            return Err(TransportError::Timeout(timeout_ms));
        }
        buf[..len].copy_from_slice(&report[..len]);
        log::debug!("HID read {}: {}", self.path, hex::encode(&buf[..len]));
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_slt_board() {
        let config = HidConfig::default();
        assert!(is_board(&config, 1240, 63));
        assert!(!is_board(&config, 0x04D8, 0x0040));
        assert!(!is_board(&config, 0x2E8A, 0x003F));
    }

    #[test]
    fn custom_ids_replace_defaults() {
        let config = HidConfig {
            vendor_id: 0x16C0,
            product_id: 0x0486,
            ..HidConfig::default()
        };
        assert!(is_board(&config, 0x16C0, 0x0486));
        assert!(!is_board(&config, SLT_VID, SLT_PID));
    }
}
