#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use firstmakers_lib::config::ConnectionConfig;
use firstmakers_lib::device::{ConnectionManager, ConnectionState, Endpoint, TransportKind};
use firstmakers_lib::sensor::REPORT_SIZE;
use firstmakers_lib::transport::{
    AnalogLink, AnalogSamples, Connector, DeviceLink, EventSink, ReportLink, Result, TransportError,
};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyBehavior {
    Immediate,
    Never,
    CloseBeforeReady,
}

pub enum Reply {
    Frame(Vec<u8>),
    Fail(&'static str),
}

struct Script {
    endpoints: Vec<Endpoint>,
    ready: ReadyBehavior,
    replies: VecDeque<Reply>,
    written: Vec<Vec<u8>>,
    sinks: Vec<EventSink>,
    fail_close: bool,
    fail_prepare: bool,
    close_on_prepare: bool,
    open_delay: Option<Duration>,
    read_delay: Option<Duration>,
}

struct Inner {
    kind: TransportKind,
    script: Mutex<Script>,
    list_calls: AtomicUsize,
    open_calls: AtomicUsize,
    close_calls: AtomicUsize,
    samples: watch::Sender<AnalogSamples>,
}

/// Scriptable stand-in for a serial or HID connector. Clones share state.
#[derive(Clone)]
pub struct MockConnector {
    inner: Arc<Inner>,
}

impl MockConnector {
    pub fn new(kind: TransportKind) -> Self {
        let (samples, _) = watch::channel(AnalogSamples::default());
        let endpoint = match kind {
            TransportKind::Serial => Endpoint::new(kind, "/dev/ttyACM0").with_usb_ids(0x2341, 0x0043),
            TransportKind::Hid => Endpoint::new(kind, "/dev/hidraw3").with_usb_ids(0x04D8, 0x003F),
        };
        Self {
            inner: Arc::new(Inner {
                kind,
                script: Mutex::new(Script {
                    endpoints: vec![endpoint],
                    ready: ReadyBehavior::Immediate,
                    replies: VecDeque::new(),
                    written: Vec::new(),
                    sinks: Vec::new(),
                    fail_close: false,
                    fail_prepare: false,
                    close_on_prepare: false,
                    open_delay: None,
                    read_delay: None,
                }),
                list_calls: AtomicUsize::new(0),
                open_calls: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
                samples,
            }),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.inner.script.lock().unwrap()
    }

    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) {
        self.script().endpoints = endpoints;
    }

    pub fn set_ready(&self, ready: ReadyBehavior) {
        self.script().ready = ready;
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.script().fail_close = fail;
    }

    pub fn set_fail_prepare(&self, fail: bool) {
        self.script().fail_prepare = fail;
    }

    /// The link reports itself closed while it is being prepared.
    pub fn set_close_on_prepare(&self, close: bool) {
        self.script().close_on_prepare = close;
    }

    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.script().open_delay = delay;
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.script().read_delay = delay;
    }

    pub fn push_reply(&self, reply: Reply) {
        self.script().replies.push_back(reply);
    }

    /// Queue a full-size response carrying the given raw codes.
    pub fn push_environment(&self, command: u8, raw_temperature: u16, raw_secondary: u16) {
        let mut frame = vec![0u8; REPORT_SIZE];
        frame[0] = command;
        frame[1..3].copy_from_slice(&raw_temperature.to_le_bytes());
        frame[3..5].copy_from_slice(&raw_secondary.to_le_bytes());
        self.push_reply(Reply::Frame(frame));
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.script().written.clone()
    }

    /// Event sink handed to the `n`th opened link
    pub fn sink(&self, n: usize) -> EventSink {
        self.script().sinks[n].clone()
    }

    pub fn record_sample(&self, pin: u8, value: u16) {
        self.inner.samples.send_modify(|s| s.record(pin, value));
    }

    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.inner.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Link = MockLink;

    fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    async fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script().endpoints.clone())
    }

    async fn open(&self, _endpoint: &Endpoint, events: EventSink) -> Result<MockLink> {
        self.inner.open_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.script().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let ready = {
            let mut script = self.script();
            script.sinks.push(events.clone());
            script.ready
        };
        match ready {
            ReadyBehavior::Immediate => {
                events.ready();
            }
            ReadyBehavior::CloseBeforeReady => {
                events.closed("port vanished during handshake");
            }
            ReadyBehavior::Never => {}
        }
        Ok(MockLink {
            connector: self.clone(),
            closed: false,
        })
    }

    async fn prepare(&self, _link: &mut MockLink) -> Result<()> {
        let script = self.script();
        if script.fail_prepare {
            return Err(TransportError::Io(std::io::Error::other("mode-set rejected")));
        }
        if script.close_on_prepare {
            if let Some(sink) = script.sinks.last() {
                sink.closed("cable pulled during mode-set");
            }
        }
        Ok(())
    }
}

pub struct MockLink {
    connector: MockConnector,
    closed: bool,
}

#[async_trait]
impl DeviceLink for MockLink {
    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.connector.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.connector.script().fail_close {
            return Err(TransportError::Io(std::io::Error::other("close failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl ReportLink for MockLink {
    async fn write_report(&mut self, frame: &[u8]) -> Result<usize> {
        self.connector.script().written.push(frame.to_vec());
        Ok(frame.len())
    }

    async fn read_report(&mut self, buf: &mut [u8]) -> Result<usize> {
        let delay = self.connector.script().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self.connector.script().replies.pop_front();
        match reply {
            Some(Reply::Frame(frame)) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            Some(Reply::Fail(reason)) => Err(TransportError::Io(std::io::Error::other(reason))),
            None => Err(TransportError::Timeout(100)),
        }
    }
}

impl AnalogLink for MockLink {
    fn analog_samples(&self) -> watch::Receiver<AnalogSamples> {
        self.connector.inner.samples.subscribe()
    }
}

pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout_ms: 200,
        close_timeout_ms: 200,
        retired_history: 4,
    }
}

pub fn manager(connector: &MockConnector) -> Arc<ConnectionManager<MockConnector>> {
    Arc::new(ConnectionManager::new(connector.clone(), fast_config()))
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub async fn wait_for_state(manager: &ConnectionManager<MockConnector>, state: ConnectionState) -> bool {
    eventually(|| manager.state() == state).await
}
