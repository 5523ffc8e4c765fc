//! Local handle table.
//!
//! The server's opaque handle bytes never escape the session: callers hold a
//! [`Handle`] wrapping a locally generated key, and every use goes through a
//! table lookup. Closing removes the entry, so use-after-close is a
//! detectable `InvalidHandle` failure instead of sending stale bytes to the
//! server.

use std::collections::HashMap;

use crate::error::{Result, SftpError};

/// Opaque reference to an open remote file or directory. Valid only for the
/// session that issued it, until closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    key: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleKind {
    File,
    Directory,
}

#[derive(Debug)]
pub(crate) struct RemoteHandle {
    pub(crate) bytes: Vec<u8>,
    pub(crate) kind: HandleKind,
    /// Set once a READDIR on this directory handle returned EOF; further
    /// listing calls short-circuit without touching the wire.
    pub(crate) exhausted: bool,
}

/// Arena of open handles, keyed by locally generated integers. Keys are
/// never reused within a session.
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    next_key: u32,
    entries: HashMap<u32, RemoteHandle>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, bytes: Vec<u8>, kind: HandleKind) -> Handle {
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1);
        self.entries.insert(
            key,
            RemoteHandle {
                bytes,
                kind,
                exhausted: false,
            },
        );
        Handle { key }
    }

    pub(crate) fn get(&self, handle: Handle) -> Result<&RemoteHandle> {
        self.entries.get(&handle.key).ok_or(SftpError::InvalidHandle)
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Result<&mut RemoteHandle> {
        self.entries
            .get_mut(&handle.key)
            .ok_or(SftpError::InvalidHandle)
    }

    /// Removes the entry, invalidating the local key immediately. The caller
    /// still owns sending CLOSE for the returned bytes.
    pub(crate) fn remove(&mut self, handle: Handle) -> Result<RemoteHandle> {
        self.entries
            .remove(&handle.key)
            .ok_or(SftpError::InvalidHandle)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
