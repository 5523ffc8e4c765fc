//! Request/response correlation: the pending-slot table that matches
//! asynchronous server responses back to their originating requests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{trace, warn};

use crate::error::{Result, SftpError};
use crate::packet::ServerPacket;

/// Terminal resolution of one request.
#[derive(Debug)]
pub(crate) enum Completion {
    /// The server's response (success or per-request status failure).
    Response(ServerPacket),
    /// Session-loss failure injected locally; the request never got (and
    /// will never get) a wire response routed to it.
    Failed(SftpError),
}

/// Every request id registered while the correlator is open receives
/// exactly one `Completion`, via `complete`, `cancel` (resolved by the
/// caller), or `cancel_all`.
pub(crate) struct Correlator {
    next_id: AtomicU32,
    inner: Mutex<Inner>,
    drained: Condvar,
}

struct Inner {
    open: bool,
    pending: HashMap<u32, Sender<Completion>>,
    /// Ids cancelled locally whose wire response has not arrived yet. The
    /// late response is discarded instead of being a protocol violation.
    cancelled: HashSet<u32>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                open: true,
                pending: HashMap::new(),
                cancelled: HashSet::new(),
            }),
            drained: Condvar::new(),
        }
    }

    /// Allocates the next request id and registers its completion slot.
    /// Ids are monotonic and wrap at 2^32; the in-flight window is far
    /// below that, so a live id cannot be reissued.
    pub(crate) fn register(&self, reply: Sender<Completion>) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(SftpError::SessionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug_assert!(!inner.pending.contains_key(&id));
        inner.pending.insert(id, reply);
        Ok(id)
    }

    /// Routes a decoded response to its pending slot.
    ///
    /// An id with no slot is a protocol violation unless it was locally
    /// cancelled, in which case the late response is dropped silently.
    pub(crate) fn complete(&self, id: u32, packet: ServerPacket) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reply) = inner.pending.remove(&id) {
            if inner.pending.is_empty() {
                self.drained.notify_all();
            }
            drop(inner);
            if reply.send(Completion::Response(packet)).is_err() {
                // Caller abandoned the slot without cancelling; the request
                // still counts as resolved.
                warn!("completion for request {} had no listener", id);
            }
            Ok(())
        } else if inner.cancelled.remove(&id) {
            trace!("discarding late response for cancelled request {}", id);
            Ok(())
        } else {
            Err(SftpError::UnknownRequestId(id))
        }
    }

    /// Withdraws a pending slot because the caller resolved it locally
    /// (cancellation or timeout). Returns false when the request already
    /// completed, so the caller can pick up the real result instead.
    pub(crate) fn cancel(&self, id: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.remove(&id).is_some() {
            inner.cancelled.insert(id);
            if inner.pending.is_empty() {
                self.drained.notify_all();
            }
            true
        } else {
            false
        }
    }

    /// Resolves every pending slot with a session-loss failure and refuses
    /// further registrations. Invoked on teardown or fatal I/O error.
    pub(crate) fn cancel_all(&self, mut failure: impl FnMut() -> SftpError) {
        let slots: Vec<(u32, Sender<Completion>)> = {
            let mut inner = self.inner.lock().unwrap();
            inner.open = false;
            inner.cancelled.clear();
            let slots = inner.pending.drain().collect();
            self.drained.notify_all();
            slots
        };
        for (id, reply) in slots {
            trace!("cancelling in-flight request {}", id);
            let _ = reply.send(Completion::Failed(failure()));
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Blocks until no requests are pending, or the timeout elapses.
    /// Returns true when fully drained.
    pub(crate) fn wait_drained(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        let (inner, _) = self
            .drained
            .wait_timeout_while(inner, timeout, |inner| !inner.pending.is_empty())
            .unwrap();
        inner.pending.is_empty()
    }
}
