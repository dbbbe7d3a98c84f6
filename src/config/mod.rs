pub mod settings;

pub use settings::{
    ConnectionConfig, HidConfig, RequestPolicy, SensorSettings, SerialConfig, Settings,
};
