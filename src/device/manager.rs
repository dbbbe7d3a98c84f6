use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{
    ConnectionState, DeviceError, DeviceHandle, Endpoint, HandleId, HandleInfo, Result,
    TransportKind,
};
use crate::config::ConnectionConfig;
use crate::transport::{Connector, DeviceLink, EventSink, LinkEvent, TransportError};

type Outcome<L> = Result<Arc<DeviceHandle<L>>>;

enum Slot<L> {
    Absent,
    Connecting {
        attempt: u64,
        outcome: watch::Receiver<Option<Outcome<L>>>,
        // Set by `close`; the attempt's handle is discarded instead of promoted.
        cancelled: bool,
    },
    Ready(Arc<DeviceHandle<L>>),
    Retiring {
        handle: HandleId,
        done: watch::Receiver<bool>,
    },
}

enum Next<L> {
    Lead(u64, watch::Sender<Option<Outcome<L>>>),
    Follow(watch::Receiver<Option<Outcome<L>>>),
    AwaitRetirement(watch::Receiver<bool>),
    Retire(HandleId),
}

enum Closing<L> {
    Retire(HandleId),
    AwaitRetirement(watch::Receiver<bool>),
    AwaitAttempt(watch::Receiver<Option<Outcome<L>>>),
}

/// Owns the single current handle of one transport kind.
///
/// All slot transitions go through one mutex that is never held across an
/// await. Connect attempts are shared: callers arriving while an attempt is in
/// flight wait for its outcome instead of opening the transport again.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    config: ConnectionConfig,
    shared: Arc<Shared<C::Link>>,
}

struct Shared<L> {
    kind: TransportKind,
    slot: StdMutex<Slot<L>>,
    retired: StdMutex<VecDeque<Arc<DeviceHandle<L>>>>,
    history_limit: usize,
    close_timeout: Duration,
    next_handle: AtomicU64,
    next_attempt: AtomicU64,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, config: ConnectionConfig) -> Self {
        let shared = Shared {
            kind: connector.kind(),
            slot: StdMutex::new(Slot::Absent),
            retired: StdMutex::new(VecDeque::new()),
            history_limit: config.retired_history.max(1),
            close_timeout: config.close_timeout(),
            next_handle: AtomicU64::new(1),
            next_attempt: AtomicU64::new(1),
        };
        Self {
            connector: Arc::new(connector),
            config,
            shared: Arc::new(shared),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.shared.kind
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.shared.lock_slot() {
            Slot::Absent => ConnectionState::Absent,
            Slot::Connecting { .. } => ConnectionState::Connecting,
            Slot::Ready(_) => ConnectionState::Ready,
            Slot::Retiring { .. } => ConnectionState::Retiring,
        }
    }

    pub fn current(&self) -> Option<HandleInfo> {
        match &*self.shared.lock_slot() {
            Slot::Ready(handle) => Some(handle.info()),
            _ => None,
        }
    }

    /// Retired handles still referenced by the history, oldest first.
    pub fn retired(&self) -> Vec<HandleInfo> {
        self.shared.lock_retired().iter().map(|h| h.info()).collect()
    }

    /// Enumerate candidate endpoints without touching the current handle.
    pub async fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        Ok(self.connector.list_endpoints().await?)
    }

    /// Return the current handle, connecting first if there is none.
    pub async fn acquire(&self) -> Result<Arc<DeviceHandle<C::Link>>> {
        loop {
            let next = {
                let mut slot = self.shared.lock_slot();
                let observed = match &*slot {
                    Slot::Ready(handle) if handle.is_open() => return Ok(handle.clone()),
                    Slot::Ready(handle) => Some(Next::Retire(handle.id())),
                    Slot::Connecting { outcome, .. } => Some(Next::Follow(outcome.clone())),
                    Slot::Retiring { done, .. } => Some(Next::AwaitRetirement(done.clone())),
                    Slot::Absent => None,
                };
                match observed {
                    Some(next) => next,
                    None => {
                        let attempt = self.shared.next_attempt.fetch_add(1, Ordering::SeqCst);
                        let (tx, rx) = watch::channel(None);
                        *slot = Slot::Connecting {
                            attempt,
                            outcome: rx,
                            cancelled: false,
                        };
                        Next::Lead(attempt, tx)
                    }
                }
            };

            match next {
                Next::Lead(attempt, tx) => {
                    let mut guard = AttemptGuard {
                        shared: self.shared.as_ref(),
                        attempt,
                        finished: false,
                    };
                    let mut outcome = self.connect().await;
                    let promoted = self.shared.finish_attempt(attempt, outcome.as_ref().ok());
                    guard.finished = true;
                    let refused = match &outcome {
                        Ok(handle) if !promoted => Some(handle.clone()),
                        _ => None,
                    };
                    if let Some(handle) = refused {
                        outcome = Err(TransportError::Closed.into());
                        // Waiters, `close` included, see the outcome only once the link is released.
                        let _ = self.shared.discard(handle).await;
                    }
                    let _ = tx.send(Some(outcome.clone()));
                    return outcome;
                }
                Next::Follow(mut rx) => {
                    if let Ok(outcome) = rx.wait_for(Option::is_some).await {
                        if let Some(outcome) = outcome.clone() {
                            return outcome;
                        }
                    }
                    // The leader was dropped mid-attempt; its guard reset the slot.
                }
                Next::AwaitRetirement(mut rx) => {
                    let _ = rx.wait_for(|done| *done).await;
                }
                Next::Retire(id) => {
                    self.shared.retire(id, "handle found closed");
                }
            }
        }
    }

    /// Disconnect notification for `handle`. A no-op unless `handle` is current.
    ///
    /// Must be called from within a Tokio runtime; the retired link is closed
    /// on a background task.
    pub fn on_disconnect(&self, handle: HandleId) -> bool {
        self.shared.retire(handle, "disconnect reported")
    }

    /// Gracefully close the current handle, if any. Never fails: close errors
    /// are logged and the slot is cleared regardless.
    ///
    /// An attempt in flight is cancelled: its handle is closed instead of
    /// becoming current, and `close` returns once that is done.
    pub async fn close(&self) {
        loop {
            let pending = {
                let mut slot = self.shared.lock_slot();
                match &mut *slot {
                    Slot::Ready(handle) => Closing::Retire(handle.id()),
                    Slot::Retiring { done, .. } => Closing::AwaitRetirement(done.clone()),
                    Slot::Connecting {
                        attempt,
                        outcome,
                        cancelled,
                    } => {
                        log::info!("Cancelling {} connect attempt {}", self.shared.kind, attempt);
                        *cancelled = true;
                        Closing::AwaitAttempt(outcome.clone())
                    }
                    Slot::Absent => return,
                }
            };
            match pending {
                Closing::Retire(id) => {
                    if let Some(task) = self.shared.begin_retire(id, "close requested") {
                        let _ = task.await;
                    }
                    return;
                }
                Closing::AwaitRetirement(mut done) => {
                    let _ = done.wait_for(|done| *done).await;
                }
                Closing::AwaitAttempt(mut outcome) => {
                    // A dropped leader resets the slot through its guard.
                    let _ = outcome.wait_for(Option::is_some).await;
                }
            }
        }
    }

    async fn connect(&self) -> Outcome<C::Link> {
        let kind = self.shared.kind;
        let endpoints = match self.connector.list_endpoints().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                log::warn!("Enumerating {} endpoints failed: {}", kind, e);
                Vec::new()
            }
        };
        let Some(endpoint) = endpoints.into_iter().next() else {
            log::info!("No {} boards available", kind);
            return Err(DeviceError::NoDeviceFound(kind));
        };

        let id = HandleId(self.shared.next_handle.fetch_add(1, Ordering::SeqCst));
        let (tx, mut events) = mpsc::unbounded_channel();
        log::info!("Attempting to connect to {} endpoint {} as handle {}", kind, endpoint, id);
        let mut link = self
            .connector
            .open(&endpoint, EventSink::new(id, tx))
            .await?;

        let connect_timeout = self.config.connect_timeout();
        match timeout(connect_timeout, wait_ready(&mut events)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                log::warn!("{} closed before becoming ready: {}", endpoint, reason);
                self.shared.close_abandoned(link);
                return Err(TransportError::Closed.into());
            }
            Err(_) => {
                log::warn!("Could not connect to {} within {:?}", endpoint, connect_timeout);
                self.shared.close_abandoned(link);
                return Err(DeviceError::ConnectTimeout {
                    endpoint: endpoint.id,
                    timeout: connect_timeout,
                });
            }
        }

        if let Err(e) = self.connector.prepare(&mut link).await {
            log::warn!("Preparing {} failed: {}", endpoint, e);
            self.shared.close_abandoned(link);
            return Err(e.into());
        }

        let handle = Arc::new(DeviceHandle::new(id, endpoint, link));
        tokio::spawn(listen(
            Arc::downgrade(&self.shared),
            Arc::downgrade(&handle),
            events,
        ));
        log::info!("Connected to {} as handle {}", handle.endpoint(), id);
        Ok(handle)
    }
}

impl<L: DeviceLink> Shared<L> {
    fn lock_slot(&self) -> StdMutexGuard<'_, Slot<L>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_retired(&self) -> StdMutexGuard<'_, VecDeque<Arc<DeviceHandle<L>>>> {
        self.retired.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connecting -> Ready or Absent, if `attempt` still owns the slot.
    ///
    /// Returns whether `handle` became current. A handle whose link closed
    /// before promotion, or whose attempt was cancelled, is refused.
    fn finish_attempt(&self, attempt: u64, handle: Option<&Arc<DeviceHandle<L>>>) -> bool {
        let mut slot = self.lock_slot();
        let cancelled = match &*slot {
            Slot::Connecting {
                attempt: a,
                cancelled,
                ..
            } if *a == attempt => *cancelled,
            _ => return false,
        };
        match handle {
            Some(handle) if handle.is_open() && !cancelled => {
                *slot = Slot::Ready(handle.clone());
                true
            }
            _ => {
                *slot = Slot::Absent;
                false
            }
        }
    }

    /// Close a handle that was opened but never became current.
    fn discard(&self, handle: Arc<DeviceHandle<L>>) -> JoinHandle<()> {
        handle.retire();
        log::info!(
            "Discarding {} handle {} on {} before it became current",
            self.kind,
            handle.id(),
            handle.endpoint().id
        );
        self.remember(handle.clone());
        let (kind, close_timeout) = (self.kind, self.close_timeout);
        tokio::spawn(async move {
            match timeout(close_timeout, handle.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Closing discarded {} handle {} failed: {}", kind, handle.id(), e),
                Err(_) => log::warn!("Closing discarded {} handle {} timed out", kind, handle.id()),
            }
        })
    }

    fn retire(self: &Arc<Self>, id: HandleId, reason: &str) -> bool {
        self.begin_retire(id, reason).is_some()
    }

    /// Ready -> Retiring for the current handle `id`, spawning its close.
    fn begin_retire(self: &Arc<Self>, id: HandleId, reason: &str) -> Option<JoinHandle<()>> {
        let (handle, done_tx) = {
            let mut slot = self.lock_slot();
            let handle = match &*slot {
                Slot::Ready(handle) if handle.id() == id => handle.clone(),
                _ => {
                    log::debug!("Ignoring {} for stale {} handle {}", reason, self.kind, id);
                    return None;
                }
            };
            // Detach before the slot is cleared.
            handle.retire();
            let (done_tx, done_rx) = watch::channel(false);
            *slot = Slot::Retiring { handle: id, done: done_rx };
            (handle, done_tx)
        };
        log::info!("Retiring {} handle {} on {}: {}", self.kind, id, handle.endpoint().id, reason);
        self.remember(handle.clone());

        let shared = self.clone();
        Some(tokio::spawn(async move {
            match timeout(shared.close_timeout, handle.close()).await {
                Ok(Ok(())) => log::info!("Closed {} handle {}", shared.kind, id),
                Ok(Err(e)) => log::warn!("Closing {} handle {} failed: {}", shared.kind, id, e),
                Err(_) => log::warn!(
                    "Closing {} handle {} did not finish within {:?}",
                    shared.kind,
                    id,
                    shared.close_timeout
                ),
            }
            {
                let mut slot = shared.lock_slot();
                if matches!(&*slot, Slot::Retiring { handle, .. } if *handle == id) {
                    *slot = Slot::Absent;
                }
            }
            let _ = done_tx.send(true);
        }))
    }

    fn remember(&self, handle: Arc<DeviceHandle<L>>) {
        let mut retired = self.lock_retired();
        retired.push_back(handle);
        while retired.len() > self.history_limit {
            retired.pop_front();
        }
    }

    /// Close a link that never became current.
    fn close_abandoned(&self, mut link: L) {
        let close_timeout = self.close_timeout;
        let kind = self.kind;
        tokio::spawn(async move {
            match timeout(close_timeout, link.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Closing abandoned {} link failed: {}", kind, e),
                Err(_) => log::warn!("Closing abandoned {} link timed out", kind),
            }
        });
    }
}

/// Resets the slot if the leading `acquire` is dropped before finishing.
struct AttemptGuard<'a, L: DeviceLink> {
    shared: &'a Shared<L>,
    attempt: u64,
    finished: bool,
}

impl<L: DeviceLink> Drop for AttemptGuard<'_, L> {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.finish_attempt(self.attempt, None);
        }
    }
}

async fn wait_ready(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> std::result::Result<(), String> {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Ready => return Ok(()),
            LinkEvent::Closed { reason } => return Err(reason),
        }
    }
    Err("event channel dropped".to_string())
}

async fn listen<L: DeviceLink>(
    shared: Weak<Shared<L>>,
    handle: Weak<DeviceHandle<L>>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(handle) = handle.upgrade() else { break };
        if !handle.is_attached() {
            log::debug!("Dropping {:?} from detached handle {}", event, handle.id());
            break;
        }
        let Some(shared) = shared.upgrade() else { break };
        match event {
            LinkEvent::Ready => log::debug!("Handle {} reported ready again", handle.id()),
            LinkEvent::Closed { reason } => {
                log::info!("Board was disconnected from {} ({})", handle.endpoint().id, reason);
                // Mark the handle dead first: if its attempt has not been
                // promoted yet, `finish_attempt` refuses it.
                handle.retire();
                shared.retire(handle.id(), "link closed");
                break;
            }
        }
    }
}
