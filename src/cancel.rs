//! Caller-supplied cancellation for pending operations.
//!
//! Cancellation is channel-backed so operation waits can `select!` over the
//! completion slot and the token at the same time. Firing the handle (or
//! dropping the last clone of it) disconnects the channel, which every token
//! clone observes.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, never, Receiver, Sender, TryRecvError};

/// The side that triggers cancellation.
///
/// Dropping the last clone without calling [`cancel`](Self::cancel) also
/// cancels: keep the handle alive for as long as the operation may run.
#[derive(Clone)]
pub struct CancelHandle {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // Dropping the sender disconnects every token clone.
        self.trigger.lock().unwrap().take();
    }
}

/// The side an operation watches. Cloneable; all clones observe the same
/// cancellation.
#[derive(Clone)]
pub struct CancelToken {
    signal: Receiver<()>,
}

impl CancelToken {
    /// A linked handle/token pair.
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = bounded::<()>(0);
        (
            CancelHandle {
                trigger: Arc::new(Mutex::new(Some(tx))),
            },
            CancelToken { signal: rx },
        )
    }

    /// A token that never fires; the default for uncancellable waits.
    pub fn never() -> CancelToken {
        CancelToken { signal: never() }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// The raw channel, for `select!` in operation waits.
    pub(crate) fn channel(&self) -> &Receiver<()> {
        &self.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::never()
    }
}
