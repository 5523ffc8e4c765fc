//! Frame codec for the SFTP subprotocol.
//!
//! Every message is `u32` big-endian length, one type byte, then a
//! type-specific payload; the length counts the type byte. Requests carry a
//! `u32` request id right after the type byte (except `SSH_FXP_INIT`).

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::constants::*;
use crate::error::{Result, SftpError};
use crate::types::{decode_utf8, DirEntry, FileAttributes};

// Wire primitives. Reads fail with `MalformedPacket` when a field overruns
// the frame; writes into a Vec cannot fail.

pub(crate) fn get_u8(reader: &mut Cursor<&[u8]>) -> Result<u8> {
    reader
        .read_u8()
        .map_err(|_| SftpError::MalformedPacket("field overruns packet boundary"))
}

pub(crate) fn get_u32(reader: &mut Cursor<&[u8]>) -> Result<u32> {
    reader
        .read_u32::<BigEndian>()
        .map_err(|_| SftpError::MalformedPacket("field overruns packet boundary"))
}

pub(crate) fn get_u64(reader: &mut Cursor<&[u8]>) -> Result<u64> {
    reader
        .read_u64::<BigEndian>()
        .map_err(|_| SftpError::MalformedPacket("field overruns packet boundary"))
}

/// Length-prefixed byte string: `u32` length then that many raw bytes.
pub(crate) fn get_string(reader: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = get_u32(reader)? as usize;
    let remaining = reader.get_ref().len() - reader.position() as usize;
    if len > remaining {
        return Err(SftpError::MalformedPacket("string overruns packet boundary"));
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|_| SftpError::MalformedPacket("string overruns packet boundary"))?;
    Ok(buf)
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

/// Requests the engine sends. Request ids are assigned at submission time,
/// so the variants carry everything except the id.
#[derive(Debug, Clone)]
pub enum ClientPacket {
    Init { version: u32 },
    Open { path: String, pflags: u32, attrs: FileAttributes },
    Close { handle: Vec<u8> },
    Read { handle: Vec<u8>, offset: u64, len: u32 },
    Write { handle: Vec<u8>, offset: u64, data: Vec<u8> },
    LStat { path: String },
    FStat { handle: Vec<u8> },
    SetStat { path: String, attrs: FileAttributes },
    FSetStat { handle: Vec<u8>, attrs: FileAttributes },
    OpenDir { path: String },
    ReadDir { handle: Vec<u8> },
    Remove { path: String },
    MkDir { path: String, attrs: FileAttributes },
    RmDir { path: String },
    RealPath { path: String },
    Stat { path: String },
    Rename { old_path: String, new_path: String },
    ReadLink { path: String },
    Symlink { link_path: String, target_path: String },
    Extended { request: String, data: Vec<u8> },
}

impl ClientPacket {
    pub fn packet_type(&self) -> u8 {
        match self {
            ClientPacket::Init { .. } => SSH_FXP_INIT,
            ClientPacket::Open { .. } => SSH_FXP_OPEN,
            ClientPacket::Close { .. } => SSH_FXP_CLOSE,
            ClientPacket::Read { .. } => SSH_FXP_READ,
            ClientPacket::Write { .. } => SSH_FXP_WRITE,
            ClientPacket::LStat { .. } => SSH_FXP_LSTAT,
            ClientPacket::FStat { .. } => SSH_FXP_FSTAT,
            ClientPacket::SetStat { .. } => SSH_FXP_SETSTAT,
            ClientPacket::FSetStat { .. } => SSH_FXP_FSETSTAT,
            ClientPacket::OpenDir { .. } => SSH_FXP_OPENDIR,
            ClientPacket::ReadDir { .. } => SSH_FXP_READDIR,
            ClientPacket::Remove { .. } => SSH_FXP_REMOVE,
            ClientPacket::MkDir { .. } => SSH_FXP_MKDIR,
            ClientPacket::RmDir { .. } => SSH_FXP_RMDIR,
            ClientPacket::RealPath { .. } => SSH_FXP_REALPATH,
            ClientPacket::Stat { .. } => SSH_FXP_STAT,
            ClientPacket::Rename { .. } => SSH_FXP_RENAME,
            ClientPacket::ReadLink { .. } => SSH_FXP_READLINK,
            ClientPacket::Symlink { .. } => SSH_FXP_SYMLINK,
            ClientPacket::Extended { .. } => SSH_FXP_EXTENDED,
        }
    }

    pub fn packet_name(&self) -> &'static str {
        match self {
            ClientPacket::Init { .. } => "SSH_FXP_INIT",
            ClientPacket::Open { .. } => "SSH_FXP_OPEN",
            ClientPacket::Close { .. } => "SSH_FXP_CLOSE",
            ClientPacket::Read { .. } => "SSH_FXP_READ",
            ClientPacket::Write { .. } => "SSH_FXP_WRITE",
            ClientPacket::LStat { .. } => "SSH_FXP_LSTAT",
            ClientPacket::FStat { .. } => "SSH_FXP_FSTAT",
            ClientPacket::SetStat { .. } => "SSH_FXP_SETSTAT",
            ClientPacket::FSetStat { .. } => "SSH_FXP_FSETSTAT",
            ClientPacket::OpenDir { .. } => "SSH_FXP_OPENDIR",
            ClientPacket::ReadDir { .. } => "SSH_FXP_READDIR",
            ClientPacket::Remove { .. } => "SSH_FXP_REMOVE",
            ClientPacket::MkDir { .. } => "SSH_FXP_MKDIR",
            ClientPacket::RmDir { .. } => "SSH_FXP_RMDIR",
            ClientPacket::RealPath { .. } => "SSH_FXP_REALPATH",
            ClientPacket::Stat { .. } => "SSH_FXP_STAT",
            ClientPacket::Rename { .. } => "SSH_FXP_RENAME",
            ClientPacket::ReadLink { .. } => "SSH_FXP_READLINK",
            ClientPacket::Symlink { .. } => "SSH_FXP_SYMLINK",
            ClientPacket::Extended { .. } => "SSH_FXP_EXTENDED",
        }
    }

    /// Every request except INIT carries a request id.
    fn carries_request_id(&self) -> bool {
        !matches!(self, ClientPacket::Init { .. })
    }

    /// Serializes the complete frame: length prefix, type byte, request id
    /// (where the type carries one), then the body.
    pub fn encode(&self, request_id: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.push(self.packet_type());
        if self.carries_request_id() {
            put_u32(&mut payload, request_id);
        }
        self.encode_body(&mut payload);

        let mut packet = Vec::with_capacity(4 + payload.len());
        put_u32(&mut packet, payload.len() as u32);
        packet.extend_from_slice(&payload);
        packet
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            ClientPacket::Init { version } => put_u32(buf, *version),
            ClientPacket::Open { path, pflags, attrs } => {
                put_string(buf, path.as_bytes());
                put_u32(buf, *pflags);
                attrs.encode(buf);
            }
            ClientPacket::Close { handle }
            | ClientPacket::FStat { handle }
            | ClientPacket::ReadDir { handle } => put_string(buf, handle),
            ClientPacket::Read { handle, offset, len } => {
                put_string(buf, handle);
                put_u64(buf, *offset);
                put_u32(buf, *len);
            }
            ClientPacket::Write { handle, offset, data } => {
                put_string(buf, handle);
                put_u64(buf, *offset);
                put_string(buf, data);
            }
            ClientPacket::LStat { path }
            | ClientPacket::OpenDir { path }
            | ClientPacket::Remove { path }
            | ClientPacket::RmDir { path }
            | ClientPacket::RealPath { path }
            | ClientPacket::Stat { path }
            | ClientPacket::ReadLink { path } => put_string(buf, path.as_bytes()),
            ClientPacket::SetStat { path, attrs } => {
                put_string(buf, path.as_bytes());
                attrs.encode(buf);
            }
            ClientPacket::FSetStat { handle, attrs } => {
                put_string(buf, handle);
                attrs.encode(buf);
            }
            ClientPacket::MkDir { path, attrs } => {
                put_string(buf, path.as_bytes());
                attrs.encode(buf);
            }
            ClientPacket::Rename { old_path, new_path } => {
                put_string(buf, old_path.as_bytes());
                put_string(buf, new_path.as_bytes());
            }
            ClientPacket::Symlink { link_path, target_path } => {
                put_string(buf, link_path.as_bytes());
                put_string(buf, target_path.as_bytes());
            }
            ClientPacket::Extended { request, data } => {
                put_string(buf, request.as_bytes());
                buf.extend_from_slice(data);
            }
        }
    }
}

/// Responses the server sends, decoded from one complete frame body.
#[derive(Debug, Clone)]
pub enum ServerPacket {
    Version {
        version: u32,
        extensions: Vec<(String, String)>,
    },
    Status {
        request_id: u32,
        code: u32,
        message: String,
        language_tag: String,
    },
    Handle {
        request_id: u32,
        handle: Vec<u8>,
    },
    Data {
        request_id: u32,
        data: Vec<u8>,
    },
    Name {
        request_id: u32,
        entries: Vec<DirEntry>,
    },
    Attrs {
        request_id: u32,
        attrs: FileAttributes,
    },
    ExtendedReply {
        request_id: u32,
        data: Vec<u8>,
    },
}

impl ServerPacket {
    /// Decodes a frame body (type byte first, length prefix already
    /// stripped by the reader loop).
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(frame);
        let packet_type = get_u8(&mut reader)?;

        match packet_type {
            SSH_FXP_VERSION => {
                let version = get_u32(&mut reader)?;
                let mut extensions = Vec::new();
                // Extension name/data pairs fill the rest of the frame.
                while (reader.position() as usize) < frame.len() {
                    let name = decode_utf8(get_string(&mut reader)?)?;
                    let data = decode_utf8(get_string(&mut reader)?)?;
                    extensions.push((name, data));
                }
                Ok(ServerPacket::Version { version, extensions })
            }
            SSH_FXP_STATUS => {
                let request_id = get_u32(&mut reader)?;
                let code = get_u32(&mut reader)?;
                let message = decode_utf8(get_string(&mut reader)?)?;
                let language_tag = decode_utf8(get_string(&mut reader)?)?;
                Ok(ServerPacket::Status {
                    request_id,
                    code,
                    message,
                    language_tag,
                })
            }
            SSH_FXP_HANDLE => {
                let request_id = get_u32(&mut reader)?;
                let handle = get_string(&mut reader)?;
                Ok(ServerPacket::Handle { request_id, handle })
            }
            SSH_FXP_DATA => {
                let request_id = get_u32(&mut reader)?;
                let data = get_string(&mut reader)?;
                Ok(ServerPacket::Data { request_id, data })
            }
            SSH_FXP_NAME => {
                let request_id = get_u32(&mut reader)?;
                let count = get_u32(&mut reader)?;
                let mut entries = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let name = decode_utf8(get_string(&mut reader)?)?;
                    let long_name = decode_utf8(get_string(&mut reader)?)?;
                    let attrs = FileAttributes::decode(&mut reader)?;
                    entries.push(DirEntry {
                        name,
                        long_name,
                        attrs,
                    });
                }
                Ok(ServerPacket::Name { request_id, entries })
            }
            SSH_FXP_ATTRS => {
                let request_id = get_u32(&mut reader)?;
                let attrs = FileAttributes::decode(&mut reader)?;
                Ok(ServerPacket::Attrs { request_id, attrs })
            }
            SSH_FXP_EXTENDED_REPLY => {
                let request_id = get_u32(&mut reader)?;
                let data = frame[reader.position() as usize..].to_vec();
                Ok(ServerPacket::ExtendedReply { request_id, data })
            }
            _ => Err(SftpError::MalformedPacket("unknown response packet type")),
        }
    }

    /// The embedded request id; `None` only for the handshake VERSION reply.
    pub fn request_id(&self) -> Option<u32> {
        match self {
            ServerPacket::Version { .. } => None,
            ServerPacket::Status { request_id, .. }
            | ServerPacket::Handle { request_id, .. }
            | ServerPacket::Data { request_id, .. }
            | ServerPacket::Name { request_id, .. }
            | ServerPacket::Attrs { request_id, .. }
            | ServerPacket::ExtendedReply { request_id, .. } => Some(*request_id),
        }
    }

    pub fn packet_name(&self) -> &'static str {
        match self {
            ServerPacket::Version { .. } => "SSH_FXP_VERSION",
            ServerPacket::Status { .. } => "SSH_FXP_STATUS",
            ServerPacket::Handle { .. } => "SSH_FXP_HANDLE",
            ServerPacket::Data { .. } => "SSH_FXP_DATA",
            ServerPacket::Name { .. } => "SSH_FXP_NAME",
            ServerPacket::Attrs { .. } => "SSH_FXP_ATTRS",
            ServerPacket::ExtendedReply { .. } => "SSH_FXP_EXTENDED_REPLY",
        }
    }
}
