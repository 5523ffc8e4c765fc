//! Single-exchange operations: one correlated request, one response.
//!
//! Pipelined reads and writes live in [`crate::transfer`]; directory
//! pagination in [`crate::dir`].

use log::debug;

use crate::cancel::CancelToken;
use crate::error::{Result, SftpError, StatusCode};
use crate::handles::{Handle, HandleKind};
use crate::packet::{ClientPacket, ServerPacket};
use crate::session::SftpSession;
use crate::types::{DirEntry, FileAttributes, OpenFlags};

/// Maps a STATUS response to `Ok(())` or the typed failure for its code.
pub(crate) fn status_result(packet: ServerPacket) -> Result<()> {
    match packet {
        ServerPacket::Status { code, message, .. } => match StatusCode::from_wire(code) {
            StatusCode::Ok => Ok(()),
            other => Err(SftpError::from_status(other, message)),
        },
        other => Err(SftpError::UnexpectedResponse(other.packet_name())),
    }
}

pub(crate) fn expect_handle(packet: ServerPacket) -> Result<Vec<u8>> {
    match packet {
        ServerPacket::Handle { handle, .. } => Ok(handle),
        other => status_result(other).and(Err(SftpError::UnexpectedResponse("SSH_FXP_STATUS"))),
    }
}

pub(crate) fn expect_attrs(packet: ServerPacket) -> Result<FileAttributes> {
    match packet {
        ServerPacket::Attrs { attrs, .. } => Ok(attrs),
        other => status_result(other).and(Err(SftpError::UnexpectedResponse("SSH_FXP_STATUS"))),
    }
}

pub(crate) fn expect_name(packet: ServerPacket) -> Result<Vec<DirEntry>> {
    match packet {
        ServerPacket::Name { entries, .. } => Ok(entries),
        other => status_result(other).and(Err(SftpError::UnexpectedResponse("SSH_FXP_STATUS"))),
    }
}

pub(crate) fn expect_data(packet: ServerPacket) -> Result<Vec<u8>> {
    match packet {
        ServerPacket::Data { data, .. } => Ok(data),
        other => status_result(other).and(Err(SftpError::UnexpectedResponse("SSH_FXP_STATUS"))),
    }
}

impl SftpSession {
    /// Opens a remote file, returning a session-local handle.
    pub fn open(&self, path: &str, flags: OpenFlags, attrs: &FileAttributes) -> Result<Handle> {
        let response = self.shared.request(
            &ClientPacket::Open {
                path: path.into(),
                pflags: flags.bits(),
                attrs: attrs.clone(),
            },
            &CancelToken::never(),
        )?;
        let bytes = expect_handle(response)?;
        debug!("opened {} ({} byte handle)", path, bytes.len());
        Ok(self.shared.handles.lock().unwrap().insert(bytes, HandleKind::File))
    }

    /// Opens a remote directory for iteration with [`crate::dir::DirLister`].
    pub fn opendir(&self, path: &str) -> Result<Handle> {
        let response = self.shared.request(
            &ClientPacket::OpenDir { path: path.into() },
            &CancelToken::never(),
        )?;
        let bytes = expect_handle(response)?;
        debug!("opened directory {} ({} byte handle)", path, bytes.len());
        Ok(self
            .shared
            .handles
            .lock()
            .unwrap()
            .insert(bytes, HandleKind::Directory))
    }

    /// Closes a handle. The local key is invalidated immediately; the
    /// server's verdict on the CLOSE itself is still surfaced, so a handle
    /// the server already discarded reports its failure status rather than
    /// being swallowed. Closing the same handle twice is `InvalidHandle`.
    pub fn close(&self, handle: Handle) -> Result<()> {
        let remote = self.shared.handles.lock().unwrap().remove(handle)?;
        let response = self.shared.request(
            &ClientPacket::Close { handle: remote.bytes },
            &CancelToken::never(),
        )?;
        status_result(response)
    }

    /// One READ request at an explicit offset. Returns the server's data,
    /// which may be shorter than requested; EOF surfaces as
    /// [`SftpError::Eof`]. Pipelined streaming lives in
    /// [`read_to_end`](Self::read_to_end).
    pub fn pread(&self, handle: Handle, offset: u64, len: u32) -> Result<Vec<u8>> {
        let bytes = self.shared.handle_bytes(handle)?;
        let response = self.shared.request(
            &ClientPacket::Read {
                handle: bytes,
                offset,
                len,
            },
            &CancelToken::never(),
        )?;
        expect_data(response)
    }

    /// One WRITE request at an explicit offset.
    pub fn pwrite(&self, handle: Handle, offset: u64, data: &[u8]) -> Result<()> {
        let bytes = self.shared.handle_bytes(handle)?;
        let response = self.shared.request(
            &ClientPacket::Write {
                handle: bytes,
                offset,
                data: data.to_vec(),
            },
            &CancelToken::never(),
        )?;
        status_result(response)
    }

    /// Attributes of a path, following symlinks.
    pub fn stat(&self, path: &str) -> Result<FileAttributes> {
        let response = self.shared.request(
            &ClientPacket::Stat { path: path.into() },
            &CancelToken::never(),
        )?;
        expect_attrs(response)
    }

    /// Attributes of a path without following symlinks.
    pub fn lstat(&self, path: &str) -> Result<FileAttributes> {
        let response = self.shared.request(
            &ClientPacket::LStat { path: path.into() },
            &CancelToken::never(),
        )?;
        expect_attrs(response)
    }

    /// Attributes of an open handle.
    pub fn fstat(&self, handle: Handle) -> Result<FileAttributes> {
        let bytes = self.shared.handle_bytes(handle)?;
        let response = self
            .shared
            .request(&ClientPacket::FStat { handle: bytes }, &CancelToken::never())?;
        expect_attrs(response)
    }

    pub fn setstat(&self, path: &str, attrs: &FileAttributes) -> Result<()> {
        let response = self.shared.request(
            &ClientPacket::SetStat {
                path: path.into(),
                attrs: attrs.clone(),
            },
            &CancelToken::never(),
        )?;
        status_result(response)
    }

    pub fn fsetstat(&self, handle: Handle, attrs: &FileAttributes) -> Result<()> {
        let bytes = self.shared.handle_bytes(handle)?;
        let response = self.shared.request(
            &ClientPacket::FSetStat {
                handle: bytes,
                attrs: attrs.clone(),
            },
            &CancelToken::never(),
        )?;
        status_result(response)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let response = self.shared.request(
            &ClientPacket::Remove { path: path.into() },
            &CancelToken::never(),
        )?;
        status_result(response)
    }

    pub fn mkdir(&self, path: &str, attrs: &FileAttributes) -> Result<()> {
        let response = self.shared.request(
            &ClientPacket::MkDir {
                path: path.into(),
                attrs: attrs.clone(),
            },
            &CancelToken::never(),
        )?;
        status_result(response)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let response = self.shared.request(
            &ClientPacket::RmDir { path: path.into() },
            &CancelToken::never(),
        )?;
        status_result(response)
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let response = self.shared.request(
            &ClientPacket::Rename {
                old_path: old_path.into(),
                new_path: new_path.into(),
            },
            &CancelToken::never(),
        )?;
        status_result(response)
    }

    /// Canonicalizes a path server-side.
    pub fn realpath(&self, path: &str) -> Result<String> {
        let response = self.shared.request(
            &ClientPacket::RealPath { path: path.into() },
            &CancelToken::never(),
        )?;
        let mut entries = expect_name(response)?;
        if entries.is_empty() {
            return Err(SftpError::MalformedPacket("empty REALPATH response"));
        }
        Ok(entries.remove(0).name)
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let response = self.shared.request(
            &ClientPacket::ReadLink { path: path.into() },
            &CancelToken::never(),
        )?;
        let mut entries = expect_name(response)?;
        if entries.is_empty() {
            return Err(SftpError::MalformedPacket("empty READLINK response"));
        }
        Ok(entries.remove(0).name)
    }

    /// Creates `link_path` pointing at `target_path`.
    pub fn symlink(&self, link_path: &str, target_path: &str) -> Result<()> {
        // OpenSSH's sftp-server takes (target, link) instead of the draft's
        // (link, target); the config switch picks the server dialect.
        let packet = if self.shared.config.openssh_symlink_order {
            ClientPacket::Symlink {
                link_path: target_path.into(),
                target_path: link_path.into(),
            }
        } else {
            ClientPacket::Symlink {
                link_path: link_path.into(),
                target_path: target_path.into(),
            }
        };
        let response = self.shared.request(&packet, &CancelToken::never())?;
        status_result(response)
    }

    /// Vendor extension escape hatch. `Ok(None)` when the server answers
    /// with a bare OK status instead of EXTENDED_REPLY data.
    pub fn extended(&self, request: &str, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let response = self.shared.request(
            &ClientPacket::Extended {
                request: request.into(),
                data: data.to_vec(),
            },
            &CancelToken::never(),
        )?;
        match response {
            ServerPacket::ExtendedReply { data, .. } => Ok(Some(data)),
            other => status_result(other).map(|_| None),
        }
    }
}
