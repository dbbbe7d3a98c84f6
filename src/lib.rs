pub mod commands;
pub mod config;
pub mod device;
pub mod hid;
pub mod sensor;
pub mod serial;
pub mod service;
pub mod transport;

pub use config::Settings;
pub use device::{ConnectionManager, ConnectionState, DeviceError, DeviceHandle, TransportKind};
pub use hid::HidConnector;
pub use sensor::{AnalogFrame, CommandCode, EnvironmentReading};
pub use serial::FirmataConnector;
pub use service::{ReadingService, SensorService};
