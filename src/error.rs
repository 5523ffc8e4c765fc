use thiserror::Error;

use crate::constants::*;

pub type Result<T> = std::result::Result<T, SftpError>;

/// Server outcome codes carried by `SSH_FXP_STATUS` (protocol v3).
///
/// Codes outside the v3 range are preserved in `Other` rather than rejected,
/// since servers speaking later drafts reuse the same packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
    Other(u32),
}

impl StatusCode {
    pub fn from_wire(code: u32) -> Self {
        match code {
            SSH_FX_OK => StatusCode::Ok,
            SSH_FX_EOF => StatusCode::Eof,
            SSH_FX_NO_SUCH_FILE => StatusCode::NoSuchFile,
            SSH_FX_PERMISSION_DENIED => StatusCode::PermissionDenied,
            SSH_FX_FAILURE => StatusCode::Failure,
            SSH_FX_BAD_MESSAGE => StatusCode::BadMessage,
            SSH_FX_NO_CONNECTION => StatusCode::NoConnection,
            SSH_FX_CONNECTION_LOST => StatusCode::ConnectionLost,
            SSH_FX_OP_UNSUPPORTED => StatusCode::OpUnsupported,
            other => StatusCode::Other(other),
        }
    }

    pub fn as_wire(self) -> u32 {
        match self {
            StatusCode::Ok => SSH_FX_OK,
            StatusCode::Eof => SSH_FX_EOF,
            StatusCode::NoSuchFile => SSH_FX_NO_SUCH_FILE,
            StatusCode::PermissionDenied => SSH_FX_PERMISSION_DENIED,
            StatusCode::Failure => SSH_FX_FAILURE,
            StatusCode::BadMessage => SSH_FX_BAD_MESSAGE,
            StatusCode::NoConnection => SSH_FX_NO_CONNECTION,
            StatusCode::ConnectionLost => SSH_FX_CONNECTION_LOST,
            StatusCode::OpUnsupported => SSH_FX_OP_UNSUPPORTED,
            StatusCode::Other(code) => code,
        }
    }
}

#[derive(Debug, Error)]
pub enum SftpError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame violated the wire format. Fatal to the session.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// The server answered a request id we never issued (or already
    /// resolved). Protocol violation, fatal to the session.
    #[error("response for unknown request id {0}")]
    UnknownRequestId(u32),

    #[error("server offered unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    /// Operation attempted on a session that has been closed or torn down.
    #[error("session is closed")]
    SessionClosed,

    /// A local handle key that was never issued or was already closed.
    #[error("invalid or already-closed handle")]
    InvalidHandle,

    #[error("end of file: {0}")]
    Eof(String),

    #[error("no such file: {0}")]
    NoSuchFile(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("server failure: {0}")]
    Failure(String),

    #[error("bad message: {0}")]
    BadMessage(String),

    #[error("no connection: {0}")]
    NoConnection(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("operation unsupported: {0}")]
    OpUnsupported(String),

    #[error("server status {code}: {message}")]
    Status { code: u32, message: String },

    /// A pipelined write failed partway. `committed` is the number of bytes
    /// confirmed contiguous from the start of the write; callers may resume
    /// from that offset.
    #[error("write failed after {committed} bytes were confirmed")]
    PartialWrite {
        committed: u64,
        #[source]
        cause: Box<SftpError>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("unexpected response packet: {0}")]
    UnexpectedResponse(&'static str),
}

impl SftpError {
    /// Maps a non-OK server status to its typed failure.
    pub(crate) fn from_status(code: StatusCode, message: String) -> Self {
        match code {
            // OK is not an error; callers only reach here for failures.
            StatusCode::Ok => SftpError::Status { code: SSH_FX_OK, message },
            StatusCode::Eof => SftpError::Eof(message),
            StatusCode::NoSuchFile => SftpError::NoSuchFile(message),
            StatusCode::PermissionDenied => SftpError::PermissionDenied(message),
            StatusCode::Failure => SftpError::Failure(message),
            StatusCode::BadMessage => SftpError::BadMessage(message),
            StatusCode::NoConnection => SftpError::NoConnection(message),
            StatusCode::ConnectionLost => SftpError::ConnectionLost(message),
            StatusCode::OpUnsupported => SftpError::OpUnsupported(message),
            StatusCode::Other(code) => SftpError::Status { code, message },
        }
    }

    /// True for the EOF status, which is a termination signal rather than a
    /// failure for reads and directory listings.
    pub fn is_eof(&self) -> bool {
        matches!(self, SftpError::Eof(_))
    }

    /// True for errors that tear down the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SftpError::Io(_)
                | SftpError::MalformedPacket(_)
                | SftpError::UnknownRequestId(_)
                | SftpError::UnsupportedVersion(_)
        )
    }
}
