use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use super::{DeviceError, Endpoint, HandleId, HandleInfo, Result, TransportKind};
use crate::transport::{self, DeviceLink, TransportError};

/// Exclusive access to an open link, held for the duration of one request.
pub type LinkGuard<'a, L> = MappedMutexGuard<'a, L>;

/// An owned, open connection to one endpoint.
///
/// Handles are shared behind `Arc`; the link itself sits behind an async mutex so
/// that at most one request is in flight at a time.
pub struct DeviceHandle<L> {
    id: HandleId,
    endpoint: Endpoint,
    created_at: DateTime<Utc>,
    open: AtomicBool,
    // Cleared before the handle leaves the current slot; the event listener
    // drops everything it receives afterwards.
    attached: AtomicBool,
    link: Mutex<Option<L>>,
}

impl<L> std::fmt::Debug for DeviceHandle<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("created_at", &self.created_at)
            .field("open", &self.open)
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

impl<L: DeviceLink> DeviceHandle<L> {
    pub(crate) fn new(id: HandleId, endpoint: Endpoint, link: L) -> Self {
        Self {
            id,
            endpoint,
            created_at: Utc::now(),
            open: AtomicBool::new(true),
            attached: AtomicBool::new(true),
            link: Mutex::new(Some(link)),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.endpoint.kind
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> HandleInfo {
        HandleInfo {
            id: self.id,
            kind: self.kind(),
            endpoint: self.endpoint.clone(),
            open: self.is_open(),
            created_at: self.created_at,
        }
    }

    /// Wait for exclusive access to the link, queuing behind any request in flight.
    pub async fn lock(&self) -> Result<LinkGuard<'_, L>> {
        self.ensure_open()?;
        let guard = self.link.lock().await;
        Self::map_open(guard)
    }

    /// Exclusive access to the link, or `Busy` if a request is in flight.
    pub fn try_lock(&self) -> Result<LinkGuard<'_, L>> {
        self.ensure_open()?;
        let guard = self.link.try_lock().map_err(|_| DeviceError::Busy(self.id))?;
        Self::map_open(guard)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Closed.into())
        }
    }

    fn map_open(guard: MutexGuard<'_, Option<L>>) -> Result<LinkGuard<'_, L>> {
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| TransportError::Closed.into())
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Detach listeners and stop serving requests. Returns false if already detached.
    pub(crate) fn retire(&self) -> bool {
        self.open.store(false, Ordering::SeqCst);
        self.attached.swap(false, Ordering::SeqCst)
    }

    /// Close the link. Waits for a request in flight to finish first.
    pub(crate) async fn close(&self) -> transport::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        let link = self.link.lock().await.take();
        match link {
            Some(mut link) => link.close().await,
            None => Ok(()),
        }
    }
}
