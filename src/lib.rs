//! SFTP v3 subprotocol engine.
//!
//! This crate implements the client side of the SFTP subprotocol from
//! scratch: frame codec, request/response correlation, a single reader
//! loop per session, a local handle table, pipelined transfers, and
//! paginated directory listing. The SSH transport underneath is consumed
//! as a pair of byte-stream halves; the `ssh2` feature (on by default)
//! provides an adapter for a real SSH channel.
//!
//! ```no_run
//! use ferric_sftp::{FileAttributes, OpenFlags, SessionConfig, SftpSession};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tcp = std::net::TcpStream::connect("example.com:22")?;
//! let mut ssh = ssh2::Session::new()?;
//! ssh.set_tcp_stream(tcp);
//! ssh.handshake()?;
//! ssh.userauth_password("demo", "password")?;
//!
//! let (reader, writer) = ferric_sftp::transport::sftp_subsystem(&ssh)?;
//! let sftp = SftpSession::connect(reader, writer, SessionConfig::default())?;
//!
//! let handle = sftp.open("/etc/hostname", OpenFlags::READ, &FileAttributes::empty())?;
//! let mut contents = Vec::new();
//! sftp.read_to_end(handle, &mut contents)?;
//! sftp.close(handle)?;
//! sftp.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
mod commands;
pub mod config;
pub mod constants;
mod correlator;
pub mod dir;
pub mod error;
mod handles;
pub mod packet;
pub mod session;
pub mod transfer;
#[cfg(feature = "ssh2")]
pub mod transport;
pub mod types;

pub use cancel::{CancelHandle, CancelToken};
pub use config::{PipelineWindow, SessionConfig};
pub use dir::DirLister;
pub use error::{Result, SftpError, StatusCode};
pub use handles::Handle;
pub use session::{SessionState, SftpSession};
pub use transfer::TransferOptions;
pub use types::{DirEntry, FileAttributes, FileType, OpenFlags};
