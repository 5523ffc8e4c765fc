//! Loopback test harness: an in-memory duplex pipe and a scripted SFTP
//! server running on its own thread, so the whole engine (reader loop,
//! correlator, pipelining) is exercised end to end without a network.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

// ---------------------------------------------------------------------------
// In-memory pipe
// ---------------------------------------------------------------------------

struct PipeInner {
    buf: Mutex<PipeBuf>,
    ready: Condvar,
}

struct PipeBuf {
    data: VecDeque<u8>,
    closed: bool,
}

pub struct PipeReader {
    inner: Arc<PipeInner>,
}

pub struct PipeWriter {
    inner: Arc<PipeInner>,
}

pub fn pipe() -> (PipeWriter, PipeReader) {
    let inner = Arc::new(PipeInner {
        buf: Mutex::new(PipeBuf {
            data: VecDeque::new(),
            closed: false,
        }),
        ready: Condvar::new(),
    });
    (
        PipeWriter {
            inner: Arc::clone(&inner),
        },
        PipeReader { inner },
    )
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.inner.buf.lock().unwrap();
        while state.data.is_empty() && !state.closed {
            state = self.inner.ready.wait(state).unwrap();
        }
        if state.data.is_empty() {
            return Ok(0); // EOF
        }
        let n = buf.len().min(state.data.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.data.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.buf.lock().unwrap();
        if state.closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.data.extend(buf);
        self.inner.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.inner.buf.lock().unwrap();
        state.closed = true;
        self.inner.ready.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Wire helpers (server side)
// ---------------------------------------------------------------------------

const SSH_FXP_INIT: u8 = 1;
const SSH_FXP_VERSION: u8 = 2;
const SSH_FXP_OPEN: u8 = 3;
const SSH_FXP_CLOSE: u8 = 4;
const SSH_FXP_READ: u8 = 5;
const SSH_FXP_WRITE: u8 = 6;
const SSH_FXP_LSTAT: u8 = 7;
const SSH_FXP_FSTAT: u8 = 8;
const SSH_FXP_OPENDIR: u8 = 11;
const SSH_FXP_READDIR: u8 = 12;
const SSH_FXP_REALPATH: u8 = 16;
const SSH_FXP_STAT: u8 = 17;
const SSH_FXP_READLINK: u8 = 19;
const SSH_FXP_STATUS: u8 = 101;
const SSH_FXP_HANDLE: u8 = 102;
const SSH_FXP_DATA: u8 = 103;
const SSH_FXP_NAME: u8 = 104;
const SSH_FXP_ATTRS: u8 = 105;

pub const SSH_FX_OK: u32 = 0;
pub const SSH_FX_EOF: u32 = 1;
pub const SSH_FX_NO_SUCH_FILE: u32 = 2;
pub const SSH_FX_FAILURE: u32 = 4;

const ATTR_SIZE: u32 = 0x00000001;

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

struct FrameReader<'a> {
    frame: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(frame: &'a [u8]) -> Self {
        Self { frame, pos: 0 }
    }

    fn u8(&mut self) -> u8 {
        let v = self.frame[self.pos];
        self.pos += 1;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_be_bytes(self.frame[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = u64::from_be_bytes(self.frame[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        v
    }

    fn string(&mut self) -> Vec<u8> {
        let len = self.u32() as usize;
        let v = self.frame[self.pos..self.pos + len].to_vec();
        self.pos += len;
        v
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        match reader.read(&mut len_buf[filled..])? {
            0 if filled == 0 => return Ok(None), // clean EOF between frames
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => filled += n,
        }
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    Ok(Some(frame))
}

fn write_frame(writer: &mut impl Write, payload: &[u8]) {
    let mut packet = Vec::with_capacity(4 + payload.len());
    put_u32(&mut packet, payload.len() as u32);
    packet.extend_from_slice(payload);
    // A send failure just means the client hung up; the server loop exits
    // on its next read.
    let _ = writer.write_all(&packet);
    let _ = writer.flush();
}

fn status_frame(id: u32, code: u32, message: &str) -> Vec<u8> {
    let mut payload = vec![SSH_FXP_STATUS];
    put_u32(&mut payload, id);
    put_u32(&mut payload, code);
    put_string(&mut payload, message.as_bytes());
    put_string(&mut payload, b"en");
    payload
}

fn handle_frame(id: u32, handle: &[u8]) -> Vec<u8> {
    let mut payload = vec![SSH_FXP_HANDLE];
    put_u32(&mut payload, id);
    put_string(&mut payload, handle);
    payload
}

fn data_frame(id: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![SSH_FXP_DATA];
    put_u32(&mut payload, id);
    put_string(&mut payload, data);
    payload
}

fn attrs_frame(id: u32, size: u64) -> Vec<u8> {
    let mut payload = vec![SSH_FXP_ATTRS];
    put_u32(&mut payload, id);
    put_u32(&mut payload, ATTR_SIZE);
    put_u64(&mut payload, size);
    payload
}

fn name_frame(id: u32, names: &[String]) -> Vec<u8> {
    let mut payload = vec![SSH_FXP_NAME];
    put_u32(&mut payload, id);
    put_u32(&mut payload, names.len() as u32);
    for name in names {
        put_string(&mut payload, name.as_bytes());
        let long = format!("-rw-r--r--    1 demo  demo  0 Jan  1 00:00 {name}");
        put_string(&mut payload, long.as_bytes());
        put_u32(&mut payload, 0); // empty attr block
    }
    payload
}

// ---------------------------------------------------------------------------
// Scripted server
// ---------------------------------------------------------------------------

/// Knobs for the scripted server. Defaults model a plain, well-behaved v3
/// server with an empty filesystem.
pub struct ServerConfig {
    /// Version sent in the handshake reply.
    pub version: u32,
    /// path -> contents, served for OPEN/READ/STAT and updated by WRITE.
    pub files: HashMap<String, Vec<u8>>,
    /// READDIR batches served per directory handle, then EOF.
    pub dir_batches: Vec<Vec<String>>,
    /// Respond FAILURE to the WRITE chunk starting at exactly this offset.
    pub fail_write_at: Option<u64>,
    /// Collect this many READ requests, then answer them in the given
    /// order (indices into the collected batch). Later reads are answered
    /// immediately.
    pub reorder_reads: Option<(usize, Vec<usize>)>,
    /// Sleep before answering each READ.
    pub delay_reads: Option<Duration>,
    /// Read requests but never respond (after the handshake).
    pub mute: bool,
    /// Respond FAILURE to every CLOSE.
    pub fail_close: bool,
    /// Send an unsolicited STATUS for an id nobody issued, right after the
    /// handshake.
    pub rogue_response: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: 3,
            files: HashMap::new(),
            dir_batches: Vec::new(),
            fail_write_at: None,
            reorder_reads: None,
            delay_reads: None,
            mute: false,
            fail_close: false,
            rogue_response: false,
        }
    }
}

/// Everything the server saw, for assertions.
#[derive(Default)]
pub struct ServerLog {
    /// (offset, requested length) per READ.
    pub reads: Vec<(u64, u32)>,
    /// (offset, payload length) per WRITE.
    pub writes: Vec<(u64, usize)>,
    pub readdir_count: usize,
    pub close_count: usize,
}

pub struct MockServer {
    pub log: Arc<Mutex<ServerLog>>,
    thread: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Spawns the server and returns the engine-side halves of the two
    /// pipes: what the engine reads, and where the engine writes.
    pub fn start(config: ServerConfig) -> (MockServer, PipeReader, PipeWriter) {
        let (client_tx, server_rx) = pipe(); // engine -> server
        let (server_tx, client_rx) = pipe(); // server -> engine
        let log = Arc::new(Mutex::new(ServerLog::default()));
        let thread_log = Arc::clone(&log);
        let thread = std::thread::Builder::new()
            .name("mock-sftp-server".into())
            .spawn(move || serve(config, server_rx, server_tx, thread_log))
            .unwrap();
        (
            MockServer {
                log,
                thread: Some(thread),
            },
            client_rx,
            client_tx,
        )
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct ServerState {
    config: ServerConfig,
    log: Arc<Mutex<ServerLog>>,
    /// handle bytes -> path (files) or batch cursor (directories)
    file_handles: HashMap<Vec<u8>, String>,
    dir_handles: HashMap<Vec<u8>, usize>,
    next_handle: u32,
    held_reads: Vec<(u32, u64, u32)>,
}

fn serve(config: ServerConfig, mut rx: PipeReader, mut tx: PipeWriter, log: Arc<Mutex<ServerLog>>) {
    // Handshake: one INIT, one VERSION.
    match read_frame(&mut rx) {
        Ok(Some(frame)) => {
            let mut r = FrameReader::new(&frame);
            if r.u8() != SSH_FXP_INIT {
                return;
            }
            let _client_version = r.u32();
            let mut payload = vec![SSH_FXP_VERSION];
            put_u32(&mut payload, config.version);
            write_frame(&mut tx, &payload);
        }
        _ => return,
    }

    if config.rogue_response {
        write_frame(&mut tx, &status_frame(0xDEAD_BEEF, SSH_FX_OK, "surprise"));
    }

    let mut state = ServerState {
        config,
        log,
        file_handles: HashMap::new(),
        dir_handles: HashMap::new(),
        next_handle: 0,
        held_reads: Vec::new(),
    };

    while let Ok(Some(frame)) = read_frame(&mut rx) {
        if state.config.mute {
            continue;
        }
        handle_request(&mut state, &frame, &mut tx);
    }
    // Dropping tx closes the engine's read side.
}

fn fresh_handle(state: &mut ServerState) -> Vec<u8> {
    let bytes = format!("H{}", state.next_handle).into_bytes();
    state.next_handle += 1;
    bytes
}

fn handle_request(state: &mut ServerState, frame: &[u8], tx: &mut PipeWriter) {
    let mut r = FrameReader::new(frame);
    let typ = r.u8();
    let id = r.u32();

    match typ {
        SSH_FXP_OPEN => {
            let path = String::from_utf8(r.string()).unwrap();
            let pflags = r.u32();
            const SSH_FXF_CREAT: u32 = 0x00000008;
            if pflags & SSH_FXF_CREAT != 0 {
                state.config.files.entry(path.clone()).or_default();
            }
            if state.config.files.contains_key(&path) {
                let handle = fresh_handle(state);
                state.file_handles.insert(handle.clone(), path);
                write_frame(tx, &handle_frame(id, &handle));
            } else {
                write_frame(tx, &status_frame(id, SSH_FX_NO_SUCH_FILE, "no such file"));
            }
        }
        SSH_FXP_OPENDIR => {
            let _path = r.string();
            let handle = fresh_handle(state);
            state.dir_handles.insert(handle.clone(), 0);
            write_frame(tx, &handle_frame(id, &handle));
        }
        SSH_FXP_CLOSE => {
            let _handle = r.string();
            state.log.lock().unwrap().close_count += 1;
            if state.config.fail_close {
                write_frame(tx, &status_frame(id, SSH_FX_FAILURE, "stale handle"));
            } else {
                write_frame(tx, &status_frame(id, SSH_FX_OK, ""));
            }
        }
        SSH_FXP_READ => {
            let handle = r.string();
            let offset = r.u64();
            let len = r.u32();
            state.log.lock().unwrap().reads.push((offset, len));

            if let Some(batch) = state.config.reorder_reads.as_ref().map(|(batch, _)| *batch) {
                state.held_reads.push((id, offset, len));
                if state.held_reads.len() == batch {
                    let (_, order) = state.config.reorder_reads.take().unwrap();
                    let held = std::mem::take(&mut state.held_reads);
                    for idx in order {
                        let (id, offset, len) = held[idx];
                        answer_read(state, tx, &handle, id, offset, len);
                    }
                }
                return;
            }
            if let Some(delay) = state.config.delay_reads {
                std::thread::sleep(delay);
            }
            answer_read(state, tx, &handle, id, offset, len);
        }
        SSH_FXP_WRITE => {
            let handle = r.string();
            let offset = r.u64();
            let data = r.string();
            state.log.lock().unwrap().writes.push((offset, data.len()));
            if state.config.fail_write_at == Some(offset) {
                write_frame(tx, &status_frame(id, SSH_FX_FAILURE, "disk full"));
                return;
            }
            if let Some(path) = state.file_handles.get(&handle) {
                let contents = state.config.files.entry(path.clone()).or_default();
                let end = offset as usize + data.len();
                if contents.len() < end {
                    contents.resize(end, 0);
                }
                contents[offset as usize..end].copy_from_slice(&data);
            }
            write_frame(tx, &status_frame(id, SSH_FX_OK, ""));
        }
        SSH_FXP_READDIR => {
            let handle = r.string();
            state.log.lock().unwrap().readdir_count += 1;
            let cursor = state.dir_handles.get_mut(&handle);
            match cursor {
                Some(cursor) if *cursor < state.config.dir_batches.len() => {
                    let batch = state.config.dir_batches[*cursor].clone();
                    *cursor += 1;
                    write_frame(tx, &name_frame(id, &batch));
                }
                Some(_) => write_frame(tx, &status_frame(id, SSH_FX_EOF, "")),
                None => write_frame(tx, &status_frame(id, SSH_FX_FAILURE, "bad handle")),
            }
        }
        SSH_FXP_STAT | SSH_FXP_LSTAT => {
            let path = String::from_utf8(r.string()).unwrap();
            match state.config.files.get(&path) {
                Some(contents) => write_frame(tx, &attrs_frame(id, contents.len() as u64)),
                None => write_frame(tx, &status_frame(id, SSH_FX_NO_SUCH_FILE, "no such file")),
            }
        }
        SSH_FXP_FSTAT => {
            let handle = r.string();
            let size = state
                .file_handles
                .get(&handle)
                .and_then(|path| state.config.files.get(path))
                .map(|contents| contents.len() as u64);
            match size {
                Some(size) => write_frame(tx, &attrs_frame(id, size)),
                None => write_frame(tx, &status_frame(id, SSH_FX_FAILURE, "bad handle")),
            }
        }
        SSH_FXP_REALPATH => {
            let path = String::from_utf8(r.string()).unwrap();
            let canonical = if path == "." { "/home/demo".to_string() } else { path };
            write_frame(tx, &name_frame(id, &[canonical]));
        }
        SSH_FXP_READLINK => {
            let _path = r.string();
            write_frame(tx, &name_frame(id, &["target".to_string()]));
        }
        // remove, mkdir, rmdir, rename, setstat, fsetstat, symlink
        _ => {
            write_frame(tx, &status_frame(id, SSH_FX_OK, ""));
        }
    }
}

fn answer_read(
    state: &mut ServerState,
    tx: &mut PipeWriter,
    handle: &[u8],
    id: u32,
    offset: u64,
    len: u32,
) {
    let contents = state
        .file_handles
        .get(handle)
        .and_then(|path| state.config.files.get(path));
    let Some(contents) = contents else {
        write_frame(tx, &status_frame(id, SSH_FX_FAILURE, "bad handle"));
        return;
    };
    if offset >= contents.len() as u64 {
        write_frame(tx, &status_frame(id, SSH_FX_EOF, ""));
        return;
    }
    let start = offset as usize;
    let end = (start + len as usize).min(contents.len());
    let data = contents[start..end].to_vec();
    write_frame(tx, &data_frame(id, &data));
}
