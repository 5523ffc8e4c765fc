//! ssh2-backed transport: adapts an authenticated SSH channel into the
//! read/write halves [`crate::SftpSession::connect`] consumes.
//!
//! libssh2 serializes all channel I/O behind one session lock, so both
//! halves share the channel through a mutex and the session gets a read
//! timeout: the reader loop's blocking read periodically yields the lock
//! (surfacing as `TimedOut`, which the loop retries) instead of starving
//! writers.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use log::debug;

/// How long one blocking libssh2 call may hold the channel lock.
const READ_TICK_MS: u32 = 200;

/// Opens a session channel on an authenticated SSH session, requests the
/// `sftp` subsystem, and returns the split halves.
///
/// Sets the ssh2 session timeout to a short tick; this affects every
/// channel on that session.
pub fn sftp_subsystem(session: &ssh2::Session) -> io::Result<(ReadHalf, WriteHalf)> {
    let mut channel = session.channel_session()?;
    channel.subsystem("sftp")?;
    session.set_timeout(READ_TICK_MS);
    debug!("sftp subsystem requested");
    Ok(split(channel))
}

/// Splits an already-prepared channel (subsystem requested) into halves.
pub fn split(channel: ssh2::Channel) -> (ReadHalf, WriteHalf) {
    let shared = Arc::new(Mutex::new(channel));
    (ReadHalf(Arc::clone(&shared)), WriteHalf(shared))
}

/// Read half of a shared SSH channel. The channel closes when both halves
/// are dropped.
pub struct ReadHalf(Arc<Mutex<ssh2::Channel>>);

impl Read for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.lock().unwrap().read(buf)
    }
}

/// Write half of a shared SSH channel.
pub struct WriteHalf(Arc<Mutex<ssh2::Channel>>);

impl Write for WriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}
