//! Channel session: owns the byte stream of one SFTP channel, negotiates
//! the protocol version, and runs the single reader loop that routes
//! responses to the correlator.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{after, bounded, never, Receiver, Sender};
use log::{debug, info, trace, warn};

use crate::cancel::CancelToken;
use crate::config::SessionConfig;
use crate::constants::SFTP_MINIMUM_VERSION;
use crate::correlator::{Completion, Correlator};
use crate::error::{Result, SftpError};
use crate::handles::HandleTable;
use crate::packet::{ClientPacket, ServerPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Active,
    /// Graceful close in progress: in-flight requests still complete, new
    /// submissions are rejected.
    Closing,
    Closed,
}

/// State shared between the caller-facing session, the reader thread, and
/// in-flight operations.
pub(crate) struct Shared {
    pub(crate) config: SessionConfig,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    pub(crate) correlator: Correlator,
    state: Mutex<SessionState>,
    stop: AtomicBool,
    pub(crate) handles: Mutex<HandleTable>,
}

impl Shared {
    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Fatal error path: every in-flight request resolves with a
    /// session-loss failure and the session lands in `Closed` directly.
    fn fail(&self, reason: String) {
        *self.state.lock().unwrap() = SessionState::Closed;
        self.correlator
            .cancel_all(|| SftpError::ConnectionLost(reason.clone()));
    }

    /// Registers a completion slot, frames the packet with the assigned id,
    /// and writes it under the send lock. Registration happens before the
    /// write so the reader can never see a response for an unknown id.
    pub(crate) fn submit(&self, packet: &ClientPacket, reply: Sender<Completion>) -> Result<u32> {
        if self.state() != SessionState::Active {
            return Err(SftpError::SessionClosed);
        }
        let id = self.correlator.register(reply)?;
        let bytes = packet.encode(id);
        trace!("-> {} id={} ({} bytes)", packet.packet_name(), id, bytes.len());

        let mut writer = self.writer.lock().unwrap();
        let Some(stream) = writer.as_mut() else {
            self.correlator.cancel(id);
            return Err(SftpError::SessionClosed);
        };
        if let Err(err) = stream.write_all(&bytes).and_then(|_| stream.flush()) {
            drop(writer);
            warn!("channel write failed, tearing down session: {}", err);
            self.fail(format!("channel write failed: {}", err));
            return Err(err.into());
        }
        Ok(id)
    }

    /// Blocks until the request resolves, the token fires, or the
    /// configured operation timeout elapses. Local resolutions withdraw the
    /// pending slot; a response that raced in first wins.
    pub(crate) fn wait_completion(
        &self,
        id: u32,
        reply: &Receiver<Completion>,
        cancel: &CancelToken,
    ) -> Result<ServerPacket> {
        let timeout = match self.config.operation_timeout {
            Some(t) => after(t),
            None => never(),
        };
        crossbeam_channel::select! {
            recv(reply) -> completion => match completion {
                Ok(Completion::Response(packet)) => Ok(packet),
                Ok(Completion::Failed(err)) => Err(err),
                Err(_) => Err(SftpError::SessionClosed),
            },
            recv(cancel.channel()) -> _ => self.resolve_local(id, reply, SftpError::Cancelled),
            recv(timeout) -> _ => self.resolve_local(id, reply, SftpError::Timeout),
        }
    }

    fn resolve_local(
        &self,
        id: u32,
        reply: &Receiver<Completion>,
        local: SftpError,
    ) -> Result<ServerPacket> {
        if self.correlator.cancel(id) {
            return Err(local);
        }
        // The request completed while we were deciding to abandon it.
        match reply.try_recv() {
            Ok(Completion::Response(packet)) => Ok(packet),
            Ok(Completion::Failed(err)) => Err(err),
            Err(_) => Err(local),
        }
    }

    /// One full request/response exchange.
    pub(crate) fn request(&self, packet: &ClientPacket, cancel: &CancelToken) -> Result<ServerPacket> {
        let (tx, rx) = bounded(1);
        let id = self.submit(packet, tx)?;
        self.wait_completion(id, &rx, cancel)
    }

    /// Withdraws an in-flight request so its late response is discarded.
    pub(crate) fn abandon(&self, id: u32) {
        self.correlator.cancel(id);
    }

    /// Resolves a local handle key to the server's opaque bytes.
    pub(crate) fn handle_bytes(&self, handle: crate::handles::Handle) -> Result<Vec<u8>> {
        Ok(self.handles.lock().unwrap().get(handle)?.bytes.clone())
    }
}

/// One SFTP subprotocol session over an authenticated channel.
///
/// Constructed with [`SftpSession::connect`] from the channel's read and
/// write halves. The session owns a single reader thread; callers may
/// submit requests concurrently from any number of threads.
pub struct SftpSession {
    pub(crate) shared: Arc<Shared>,
    version: u32,
    extensions: Vec<(String, String)>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SftpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSession")
            .field("version", &self.version)
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

impl SftpSession {
    /// Performs the INIT/VERSION handshake and starts the reader loop.
    ///
    /// `reader` and `writer` are the two halves of an authenticated,
    /// reliable, ordered byte stream carrying the `sftp` subsystem: an SSH
    /// channel in production, an in-memory pipe in tests. For
    /// [`shutdown`](Self::shutdown) to finish, the reader half must observe
    /// EOF once the writer half is dropped, or surface periodic
    /// `WouldBlock`/`TimedOut` reads.
    pub fn connect<R, W>(reader: R, writer: W, config: SessionConfig) -> Result<SftpSession>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let mut reader = reader;
        let mut writer = writer;

        debug!("offering SFTP protocol version {}", config.version);
        let init = ClientPacket::Init {
            version: config.version,
        };
        writer.write_all(&init.encode(0))?;
        writer.flush()?;

        // Synchronous single exchange before the reader loop exists.
        let handshake_stop = AtomicBool::new(false);
        let frame = read_frame(&mut reader, config.max_packet_size, &handshake_stop)?
            .ok_or(SftpError::SessionClosed)?;
        let (version, extensions) = match ServerPacket::decode(&frame)? {
            ServerPacket::Version {
                version: server_version,
                extensions,
            } => {
                let negotiated = config.version.min(server_version);
                if negotiated < SFTP_MINIMUM_VERSION {
                    return Err(SftpError::UnsupportedVersion(server_version));
                }
                (negotiated, extensions)
            }
            other => {
                warn!("expected SSH_FXP_VERSION, got {}", other.packet_name());
                return Err(SftpError::MalformedPacket("expected SSH_FXP_VERSION"));
            }
        };
        info!("SFTP session established (version {})", version);

        let shared = Arc::new(Shared {
            config,
            writer: Mutex::new(Some(Box::new(writer))),
            correlator: Correlator::new(),
            state: Mutex::new(SessionState::Active),
            stop: AtomicBool::new(false),
            handles: Mutex::new(HandleTable::new()),
        });

        let reader_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("sftp-reader".into())
            .spawn(move || reader_loop(&reader_shared, &mut reader))
            .map_err(SftpError::Io)?;

        Ok(SftpSession {
            shared,
            version,
            extensions,
            reader: Mutex::new(Some(handle)),
        })
    }

    /// The negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Extension pairs announced by the server during the handshake.
    pub fn extensions(&self) -> &[(String, String)] {
        &self.extensions
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Number of requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.shared.correlator.in_flight()
    }

    /// Graceful teardown: stops accepting submissions, lets in-flight
    /// requests drain for the configured grace period, then resolves any
    /// stragglers with a session-loss failure and stops the reader.
    /// Idempotent. Open handles are invalidated locally, not closed on the
    /// server; the server reclaims them when the channel goes away.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            match *state {
                SessionState::Closed | SessionState::Closing => return Ok(()),
                _ => *state = SessionState::Closing,
            }
        }
        let in_flight = self.shared.correlator.in_flight();
        if in_flight > 0 {
            debug!("closing session with {} request(s) in flight", in_flight);
            if !self.shared.correlator.wait_drained(self.shared.config.close_grace) {
                warn!("close grace period expired with requests still in flight");
            }
        }

        self.shared.stop.store(true, Ordering::Relaxed);
        // Dropping the writer half signals EOF to the peer, which unblocks
        // the reader on well-behaved transports.
        self.shared.writer.lock().unwrap().take();
        self.shared
            .correlator
            .cancel_all(|| SftpError::ConnectionLost("session closed".into()));
        *self.shared.state.lock().unwrap() = SessionState::Closed;

        let open_handles = self.shared.handles.lock().unwrap().len();
        if open_handles > 0 {
            debug!("{} handle(s) invalidated by session close", open_handles);
        }

        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
        info!("SFTP session closed");
        Ok(())
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        if self.shared.state() != SessionState::Closed {
            self.shared.stop.store(true, Ordering::Relaxed);
            self.shared.writer.lock().unwrap().take();
            *self.shared.state.lock().unwrap() = SessionState::Closed;
            self.shared
                .correlator
                .cancel_all(|| SftpError::ConnectionLost("session dropped".into()));
            // The reader thread is left detached; it exits on EOF or the
            // stop flag.
        }
    }
}

/// The single reader loop: decodes frames and routes them by request id.
/// Any I/O or decode error tears the session down.
fn reader_loop(shared: &Shared, reader: &mut dyn Read) {
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
        let frame = match read_frame(reader, shared.config.max_packet_size, &shared.stop) {
            Ok(Some(frame)) => frame,
            Ok(None) => break, // stop requested
            Err(err) => {
                if shared.stop.load(Ordering::Relaxed) {
                    break;
                }
                debug!("reader loop terminating: {}", err);
                shared.fail(format!("channel read failed: {}", err));
                break;
            }
        };
        let packet = match ServerPacket::decode(&frame) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("undecodable frame, tearing down session: {}", err);
                shared.fail(format!("{}", err));
                break;
            }
        };
        trace!("<- {} ({} byte frame)", packet.packet_name(), frame.len());
        match packet.request_id() {
            Some(id) => {
                if let Err(err) = shared.correlator.complete(id, packet) {
                    warn!("protocol violation, tearing down session: {}", err);
                    shared.fail(format!("{}", err));
                    break;
                }
            }
            None => {
                warn!("unexpected SSH_FXP_VERSION after handshake");
                shared.fail("unexpected SSH_FXP_VERSION after handshake".into());
                break;
            }
        }
    }
}

/// Reads one length-prefixed frame (body only, prefix stripped).
/// `Ok(None)` means the stop flag was observed during a stall.
fn read_frame(
    reader: &mut dyn Read,
    max_packet_size: u32,
    stop: &AtomicBool,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_exact_retry(reader, &mut len_buf, stop)? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(SftpError::MalformedPacket("zero-length frame"));
    }
    if len > max_packet_size {
        return Err(SftpError::MalformedPacket("frame exceeds maximum packet size"));
    }
    let mut frame = vec![0u8; len as usize];
    if !read_exact_retry(reader, &mut frame, stop)? {
        return Ok(None);
    }
    Ok(Some(frame))
}

/// `read_exact` that treats `WouldBlock`/`TimedOut`/`Interrupted` as a
/// stall rather than an error, checking the stop flag between attempts.
/// Returns false when stopped before the buffer filled.
fn read_exact_retry(reader: &mut dyn Read, buf: &mut [u8], stop: &AtomicBool) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        if stop.load(Ordering::Relaxed) {
            return Ok(false);
        }
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::*;
    use crate::packet::{put_string, put_u32};
    use std::io::Cursor;

    fn version_frame(version: u32) -> Vec<u8> {
        let mut payload = vec![SSH_FXP_VERSION];
        put_u32(&mut payload, version);
        let mut frame = Vec::new();
        put_u32(&mut frame, payload.len() as u32);
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn handshake_negotiates_version() {
        let session = SftpSession::connect(
            Cursor::new(version_frame(3)),
            Vec::new(),
            SessionConfig::default(),
        )
        .unwrap();
        assert_eq!(session.version(), 3);
    }

    #[test]
    fn handshake_adopts_lower_server_version() {
        // Server claims a newer version; we adopt our own maximum.
        let session = SftpSession::connect(
            Cursor::new(version_frame(6)),
            Vec::new(),
            SessionConfig::default(),
        )
        .unwrap();
        assert_eq!(session.version(), 3);
    }

    #[test]
    fn handshake_rejects_old_server() {
        let err = SftpSession::connect(
            Cursor::new(version_frame(2)),
            Vec::new(),
            SessionConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SftpError::UnsupportedVersion(2)));
    }

    #[test]
    fn handshake_rejects_non_version_reply() {
        let mut payload = vec![SSH_FXP_STATUS];
        put_u32(&mut payload, 0);
        put_u32(&mut payload, SSH_FX_FAILURE);
        put_string(&mut payload, b"nope");
        put_string(&mut payload, b"");
        let mut frame = Vec::new();
        put_u32(&mut frame, payload.len() as u32);
        frame.extend_from_slice(&payload);

        let err =
            SftpSession::connect(Cursor::new(frame), Vec::new(), SessionConfig::default())
                .unwrap_err();
        assert!(matches!(err, SftpError::MalformedPacket(_)));
    }

    #[test]
    fn init_packet_reaches_the_wire() {
        struct CaptureWriter(std::sync::mpsc::Sender<Vec<u8>>);
        impl Write for CaptureWriter {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.send(buf.to_vec()).ok();
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let _session = SftpSession::connect(
            Cursor::new(version_frame(3)),
            CaptureWriter(tx),
            SessionConfig::default(),
        )
        .unwrap();

        let written: Vec<u8> = rx.try_iter().flatten().collect();
        // length 5, SSH_FXP_INIT, version 3
        assert_eq!(written, vec![0, 0, 0, 5, SSH_FXP_INIT, 0, 0, 0, 3]);
    }

    #[test]
    fn oversized_frame_is_malformed() {
        let stop = AtomicBool::new(false);
        let mut frame = Vec::new();
        put_u32(&mut frame, 1 << 30);
        let err = read_frame(&mut Cursor::new(frame), 256 * 1024, &stop).unwrap_err();
        assert!(matches!(err, SftpError::MalformedPacket(_)));
    }

    #[test]
    fn submissions_after_shutdown_fail() {
        let session = SftpSession::connect(
            Cursor::new(version_frame(3)),
            Vec::new(),
            SessionConfig::default().close_grace(std::time::Duration::from_millis(10)),
        )
        .unwrap();
        session.shutdown().unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        let err = session
            .shared
            .request(
                &ClientPacket::Stat { path: "/".into() },
                &CancelToken::never(),
            )
            .unwrap_err();
        assert!(matches!(err, SftpError::SessionClosed));

        // Shutdown is idempotent.
        session.shutdown().unwrap();
    }
}
