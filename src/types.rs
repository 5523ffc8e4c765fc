use std::io::Cursor;

use crate::constants::*;
use crate::error::{Result, SftpError};
use crate::packet::{get_string, get_u32, get_u64, put_string, put_u32, put_u64};

bitflags::bitflags! {
    /// Open flags for `SSH_FXP_OPEN` (the v3 pflags bitset).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = SSH_FXF_READ;
        const WRITE = SSH_FXF_WRITE;
        const APPEND = SSH_FXF_APPEND;
        const CREATE = SSH_FXF_CREAT;
        /// Must be combined with `CREATE`.
        const TRUNCATE = SSH_FXF_TRUNC;
        /// Must be combined with `CREATE`.
        const EXCLUSIVE = SSH_FXF_EXCL;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    #[default]
    Unknown,
    RegularFile,
    Directory,
    Symlink,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
}

/// File attributes as carried by `SSH_FXP_ATTRS` and embedded in other
/// packets. Every field is individually optional; presence is tracked by
/// the flag bitmask on the wire.
///
/// uid/gid and atime/mtime travel as pairs under a single flag, so both
/// halves of a pair must be set for that flag to be encoded.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
    pub extended: Vec<(String, String)>,
}

impl FileAttributes {
    /// Attribute block with nothing set; servers treat it as "use defaults".
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_permissions(permissions: u32) -> Self {
        Self {
            permissions: Some(permissions),
            ..Self::default()
        }
    }

    pub fn file_type(&self) -> FileType {
        match self.permissions.map(|p| p & S_IFMT) {
            Some(S_IFREG) => FileType::RegularFile,
            Some(S_IFDIR) => FileType::Directory,
            Some(S_IFLNK) => FileType::Symlink,
            Some(S_IFCHR) => FileType::CharacterDevice,
            Some(S_IFBLK) => FileType::BlockDevice,
            Some(S_IFIFO) => FileType::Fifo,
            Some(S_IFSOCK) => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// Serializes the v3 attribute block: flag mask, then each present
    /// field in wire order.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut flags: u32 = 0;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= SSH_FILEXFER_ATTR_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= SSH_FILEXFER_ATTR_EXTENDED;
        }

        put_u32(buf, flags);
        if let Some(size) = self.size {
            put_u64(buf, size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            put_u32(buf, uid);
            put_u32(buf, gid);
        }
        if let Some(permissions) = self.permissions {
            put_u32(buf, permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            put_u32(buf, atime);
            put_u32(buf, mtime);
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            put_u32(buf, self.extended.len() as u32);
            for (name, value) in &self.extended {
                put_string(buf, name.as_bytes());
                put_string(buf, value.as_bytes());
            }
        }
    }

    pub fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        let flags = get_u32(reader)?;
        let mut attrs = FileAttributes::default();

        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(get_u64(reader)?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            attrs.uid = Some(get_u32(reader)?);
            attrs.gid = Some(get_u32(reader)?);
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(get_u32(reader)?);
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            attrs.atime = Some(get_u32(reader)?);
            attrs.mtime = Some(get_u32(reader)?);
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            let count = get_u32(reader)?;
            for _ in 0..count {
                let name = decode_utf8(get_string(reader)?)?;
                let value = decode_utf8(get_string(reader)?)?;
                attrs.extended.push((name, value));
            }
        }

        Ok(attrs)
    }
}

/// One entry from an `SSH_FXP_NAME` response: the bare filename, the
/// server-rendered `ls -l` style line, and the attribute block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub long_name: String,
    pub attrs: FileAttributes,
}

pub(crate) fn decode_utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| SftpError::MalformedPacket("string field is not UTF-8"))
}
