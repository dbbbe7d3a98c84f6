//! Collaborator seams between the connection manager and the physical transports.
//!
//! A [`Connector`] enumerates endpoints of one transport kind and opens them.
//! The opened link reports readiness and closure through the [`EventSink`] it
//! was handed at open time; the manager owns the receiving end.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::device::{Endpoint, HandleId, TransportKind};

/// Highest analog pin addressable by a Firmata analog message (4-bit pin field).
pub const MAX_ANALOG_PINS: usize = 16;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Serialport error: {0}")]
    Serialport(#[from] serialport::Error),

    #[error("HID API error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No response within {0} ms")]
    Timeout(u64),

    #[error("Link closed")]
    Closed,

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Notifications a link raises about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The device answered its handshake and can serve requests.
    Ready,
    /// The device went away or the link hit an unrecoverable error.
    Closed { reason: String },
}

/// Event channel handed to a transport when it is opened.
///
/// Events are delivered to the listener registered for [`EventSink::handle`];
/// once that handle is retired the listener is detached and further events are
/// dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    handle: HandleId,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl EventSink {
    pub fn new(handle: HandleId, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn ready(&self) -> bool {
        self.emit(LinkEvent::Ready)
    }

    pub fn closed(&self, reason: impl Into<String>) -> bool {
        self.emit(LinkEvent::Closed { reason: reason.into() })
    }

    /// Returns false once nobody listens for this handle any more.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Latest analog sample per pin, as continuously reported by the board.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalogSamples {
    values: [u16; MAX_ANALOG_PINS],
    counts: [u32; MAX_ANALOG_PINS],
}

impl AnalogSamples {
    pub fn record(&mut self, pin: u8, value: u16) {
        let pin = pin as usize;
        if pin < MAX_ANALOG_PINS {
            self.values[pin] = value;
            self.counts[pin] = self.counts[pin].saturating_add(1);
        }
    }

    /// Cached value for `pin`; zero until the first report arrives.
    pub fn value(&self, pin: u8) -> u16 {
        self.values.get(pin as usize).copied().unwrap_or(0)
    }

    pub fn has_sample(&self, pin: u8) -> bool {
        self.counts.get(pin as usize).is_some_and(|c| *c > 0)
    }

    /// True when every pin in `0..channels` has been reported at least once.
    pub fn has_all(&self, channels: u8) -> bool {
        (0..channels).all(|pin| self.has_sample(pin))
    }
}

/// An open connection to one endpoint.
#[async_trait]
pub trait DeviceLink: Send + 'static {
    /// Release the underlying resource. Called at most once per link.
    async fn close(&mut self) -> Result<()>;
}

/// Fixed-size report exchange (raw HID).
#[async_trait]
pub trait ReportLink: DeviceLink {
    async fn write_report(&mut self, frame: &[u8]) -> Result<usize>;

    /// Reads one report into `buf`, returning the number of bytes received.
    async fn read_report(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Per-pin analog cache kept current by the transport (Firmata).
pub trait AnalogLink: DeviceLink {
    fn analog_samples(&self) -> watch::Receiver<AnalogSamples>;
}

/// Enumerates and opens endpoints of a single transport kind.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Link: DeviceLink;

    fn kind(&self) -> TransportKind;

    /// Candidate endpoints in preference order.
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>>;

    /// Open `endpoint`. The link must raise [`LinkEvent::Ready`] on `events`
    /// once the device is usable.
    async fn open(&self, endpoint: &Endpoint, events: EventSink) -> Result<Self::Link>;

    /// Runs once after the ready signal, before the handle becomes current.
    async fn prepare(&self, _link: &mut Self::Link) -> Result<()> {
        Ok(())
    }
}
