//! Paginated directory listing.
//!
//! One `SSH_FXP_READDIR` per [`DirLister::read_next`] call, until the
//! server answers with an EOF status. The handle is then exhausted but
//! still open: the caller closes it explicitly.

use log::debug;

use crate::cancel::CancelToken;
use crate::error::{Result, SftpError, StatusCode};
use crate::handles::{Handle, HandleKind};
use crate::packet::{ClientPacket, ServerPacket};
use crate::session::SftpSession;
use crate::types::DirEntry;

pub struct DirLister<'s> {
    session: &'s SftpSession,
    handle: Handle,
    done: bool,
}

impl SftpSession {
    /// Starts iterating a directory handle obtained from
    /// [`opendir`](SftpSession::opendir).
    pub fn read_dir(&self, handle: Handle) -> DirLister<'_> {
        DirLister {
            session: self,
            handle,
            done: false,
        }
    }
}

impl DirLister<'_> {
    /// Fetches the next batch of entries, as many as the server packs into
    /// one response. `Ok(None)` once the listing is exhausted; calls after
    /// that return `Ok(None)` without touching the wire.
    ///
    /// A directory removed mid-iteration surfaces as the server's terminal
    /// error for this listing (commonly `NoSuchFile`); it is not retried.
    pub fn read_next(&mut self) -> Result<Option<Vec<DirEntry>>> {
        if self.done {
            return Ok(None);
        }
        let remote = {
            let handles = self.session.shared.handles.lock().unwrap();
            let remote = handles.get(self.handle)?;
            if remote.kind != HandleKind::Directory {
                return Err(SftpError::InvalidHandle);
            }
            if remote.exhausted {
                self.done = true;
                return Ok(None);
            }
            remote.bytes.clone()
        };

        let response = self.session.shared.request(
            &ClientPacket::ReadDir { handle: remote },
            &CancelToken::never(),
        )?;
        match response {
            ServerPacket::Name { entries, .. } => {
                debug!("directory batch of {} entries", entries.len());
                Ok(Some(entries))
            }
            ServerPacket::Status { code, message, .. } => match StatusCode::from_wire(code) {
                StatusCode::Eof => {
                    self.done = true;
                    if let Ok(remote) = self
                        .session
                        .shared
                        .handles
                        .lock()
                        .unwrap()
                        .get_mut(self.handle)
                    {
                        remote.exhausted = true;
                    }
                    Ok(None)
                }
                other => {
                    self.done = true;
                    Err(SftpError::from_status(other, message))
                }
            },
            other => {
                self.done = true;
                Err(SftpError::UnexpectedResponse(other.packet_name()))
            }
        }
    }

    /// Collects every remaining entry.
    pub fn read_to_end(&mut self) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        while let Some(batch) = self.read_next()? {
            entries.extend(batch);
        }
        Ok(entries)
    }
}
