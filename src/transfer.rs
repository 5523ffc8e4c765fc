//! Pipelined transfer engine.
//!
//! Reads and writes keep several chunk requests outstanding to hide
//! round-trip latency. Completions arrive in any order; reads are
//! reassembled by offset before delivery, writes track the contiguous
//! confirmed prefix so a failure reports a resumable offset.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};

use crossbeam_channel::{after, never, unbounded, Receiver};
use log::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::config::PipelineWindow;
use crate::correlator::Completion;
use crate::error::{Result, SftpError, StatusCode};
use crate::handles::Handle;
use crate::packet::{ClientPacket, ServerPacket};
use crate::session::{SftpSession, Shared};

/// Per-transfer overrides; session config supplies anything left `None`.
#[derive(Default)]
pub struct TransferOptions {
    pub chunk_size: Option<u32>,
    pub window: Option<PipelineWindow>,
    pub cancel: CancelToken,
}

impl TransferOptions {
    pub fn cancel(token: CancelToken) -> Self {
        TransferOptions {
            cancel: token,
            ..TransferOptions::default()
        }
    }
}

/// In-flight accounting against the configured window.
struct Window {
    limit: PipelineWindow,
    requests: usize,
    bytes: u64,
}

impl Window {
    fn new(limit: PipelineWindow) -> Self {
        Window {
            limit,
            requests: 0,
            bytes: 0,
        }
    }

    /// Whether one more request of `len` payload bytes fits. At least one
    /// request is always admitted so a chunk larger than a byte window can
    /// still make progress alone.
    fn admits(&self, len: u32) -> bool {
        match self.limit {
            PipelineWindow::Requests(n) => self.requests < n.max(1),
            PipelineWindow::Bytes(b) => self.requests == 0 || self.bytes + len as u64 <= b,
        }
    }

    fn submitted(&mut self, len: u32) {
        self.requests += 1;
        self.bytes += len as u64;
    }

    fn completed(&mut self, len: u32) {
        self.requests -= 1;
        self.bytes -= len as u64;
    }
}

/// Waits for the next completion on a transfer's shared reply channel.
/// Cancellation and the inactivity timeout resolve locally.
fn next_completion(
    shared: &Shared,
    rx: &Receiver<Completion>,
    cancel: &CancelToken,
) -> Result<Completion> {
    let timeout = match shared.config.operation_timeout {
        Some(t) => after(t),
        None => never(),
    };
    crossbeam_channel::select! {
        recv(rx) -> completion => completion.map_err(|_| SftpError::SessionClosed),
        recv(cancel.channel()) -> _ => Err(SftpError::Cancelled),
        recv(timeout) -> _ => Err(SftpError::Timeout),
    }
}

impl SftpSession {
    /// Streams the whole file behind `handle` into `sink`, starting at
    /// offset 0. Returns the number of bytes delivered.
    pub fn read_to_end<W: Write>(&self, handle: Handle, sink: &mut W) -> Result<u64> {
        self.read_with(handle, 0, None, sink, &TransferOptions::default())
    }

    /// Streams `len` bytes starting at `offset` (less if the file ends
    /// first).
    pub fn read_range<W: Write>(
        &self,
        handle: Handle,
        offset: u64,
        len: u64,
        sink: &mut W,
    ) -> Result<u64> {
        self.read_with(handle, offset, Some(len), sink, &TransferOptions::default())
    }

    /// Pipelined read with explicit options; the workhorse behind
    /// [`read_to_end`](Self::read_to_end) and
    /// [`read_range`](Self::read_range).
    pub fn read_with<W: Write>(
        &self,
        handle: Handle,
        offset: u64,
        len: Option<u64>,
        sink: &mut W,
        options: &TransferOptions,
    ) -> Result<u64> {
        let remote = self.shared.handle_bytes(handle)?;
        let chunk_size = options
            .chunk_size
            .unwrap_or_else(|| self.shared.config.effective_chunk_size())
            .max(1);
        let mut window = Window::new(options.window.unwrap_or(self.shared.config.window));
        let limit = len.map(|l| offset.saturating_add(l));

        let (tx, rx) = unbounded();
        // id -> (offset, requested length) for every in-flight READ
        let mut pending: HashMap<u32, (u64, u32)> = HashMap::new();
        let mut reorder: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        let mut delivered = offset;
        let mut next_offset = offset;
        let mut eof: Option<u64> = None;

        let result = loop {
            // Keep the pipeline full.
            let mut submit_err = None;
            while eof.map_or(true, |e| next_offset < e)
                && limit.map_or(true, |l| next_offset < l)
            {
                let mut want = chunk_size;
                if let Some(l) = limit {
                    want = want.min((l - next_offset) as u32);
                }
                if !window.admits(want) {
                    break;
                }
                let packet = ClientPacket::Read {
                    handle: remote.clone(),
                    offset: next_offset,
                    len: want,
                };
                match self.shared.submit(&packet, tx.clone()) {
                    Ok(id) => {
                        pending.insert(id, (next_offset, want));
                        window.submitted(want);
                        next_offset += want as u64;
                    }
                    Err(err) => {
                        submit_err = Some(err);
                        break;
                    }
                }
            }
            if let Some(err) = submit_err {
                break Err(err);
            }

            if pending.is_empty() {
                break Ok(delivered - offset);
            }

            let completion = match next_completion(&self.shared, &rx, &options.cancel) {
                Ok(completion) => completion,
                Err(err) => break Err(err),
            };
            let packet = match completion {
                Completion::Response(packet) => packet,
                Completion::Failed(err) => break Err(err),
            };
            let Some(id) = packet.request_id() else {
                break Err(SftpError::UnexpectedResponse(packet.packet_name()));
            };
            let Some((chunk_offset, requested)) = pending.remove(&id) else {
                warn!("read pipeline got a completion it never issued (id {})", id);
                continue;
            };
            window.completed(requested);

            match packet {
                ServerPacket::Data { data, .. } => {
                    trace!(
                        "read chunk at {} delivered {} of {} bytes",
                        chunk_offset,
                        data.len(),
                        requested
                    );
                    if eof.map_or(false, |e| chunk_offset >= e) {
                        // Already past end of data; a late read racing the
                        // EOF marker. Discard.
                        continue;
                    }
                    if data.is_empty() {
                        eof = Some(eof.map_or(chunk_offset, |e| e.min(chunk_offset)));
                        continue;
                    }
                    let got = data.len() as u32;
                    reorder.insert(chunk_offset, data);
                    if got < requested {
                        // Short read: request the tail so delivery stays
                        // contiguous. A server at EOF answers with Status
                        // EOF, which settles the end marker.
                        let tail_offset = chunk_offset + got as u64;
                        let tail_len = requested - got;
                        let tail = ClientPacket::Read {
                            handle: remote.clone(),
                            offset: tail_offset,
                            len: tail_len,
                        };
                        match self.shared.submit(&tail, tx.clone()) {
                            Ok(id) => {
                                pending.insert(id, (tail_offset, tail_len));
                                window.submitted(tail_len);
                            }
                            Err(err) => break Err(err),
                        }
                    }
                    // Deliver everything contiguous with what the sink
                    // already has.
                    let mut sink_err = None;
                    while let Some(entry) = reorder.first_entry() {
                        if *entry.key() != delivered {
                            break;
                        }
                        let chunk = entry.remove();
                        if let Err(err) = sink.write_all(&chunk) {
                            sink_err = Some(err);
                            break;
                        }
                        delivered += chunk.len() as u64;
                    }
                    if let Some(err) = sink_err {
                        break Err(err.into());
                    }
                }
                ServerPacket::Status { code, message, .. } => {
                    match StatusCode::from_wire(code) {
                        StatusCode::Eof => {
                            eof = Some(eof.map_or(chunk_offset, |e| e.min(chunk_offset)));
                        }
                        StatusCode::Ok => {
                            break Err(SftpError::UnexpectedResponse("SSH_FXP_STATUS"));
                        }
                        other => break Err(SftpError::from_status(other, message)),
                    }
                }
                other => break Err(SftpError::UnexpectedResponse(other.packet_name())),
            }
        };

        match result {
            Ok(total) => {
                debug!("pipelined read delivered {} bytes", total);
                Ok(total)
            }
            Err(err) => {
                // Abandon whatever is still in flight; late responses are
                // discarded rather than treated as protocol violations.
                for id in pending.keys() {
                    self.shared.abandon(*id);
                }
                Err(err)
            }
        }
    }

    /// Writes all of `data` at `offset`. Convenience over
    /// [`write_from`](Self::write_from).
    pub fn write_all_at(&self, handle: Handle, offset: u64, data: &[u8]) -> Result<u64> {
        self.write_with(handle, offset, &mut &data[..], &TransferOptions::default())
    }

    /// Streams `source` to the file behind `handle`, starting at `offset`,
    /// with pipelined WRITE requests. Returns the bytes written.
    pub fn write_from<R: Read>(&self, handle: Handle, offset: u64, source: &mut R) -> Result<u64> {
        self.write_with(handle, offset, source, &TransferOptions::default())
    }

    /// Pipelined write with explicit options.
    ///
    /// Any chunk answered with a non-OK status (or lost to session
    /// teardown) fails the whole operation with
    /// [`SftpError::PartialWrite`]; no further chunks are submitted after
    /// the failure is observed, and the error carries the byte count
    /// confirmed contiguous from `offset` so the caller can resume there.
    pub fn write_with<R: Read>(
        &self,
        handle: Handle,
        offset: u64,
        source: &mut R,
        options: &TransferOptions,
    ) -> Result<u64> {
        let remote = self.shared.handle_bytes(handle)?;
        let chunk_size = options
            .chunk_size
            .unwrap_or_else(|| self.shared.config.effective_chunk_size())
            .max(1);
        let mut window = Window::new(options.window.unwrap_or(self.shared.config.window));

        let (tx, rx) = unbounded();
        // id -> (offset, length) for every in-flight WRITE
        let mut pending: HashMap<u32, (u64, u32)> = HashMap::new();
        let mut confirmed: BTreeMap<u64, u32> = BTreeMap::new();
        let mut committed = offset;
        let mut next_offset = offset;
        let mut source_done = false;
        let mut failure: Option<SftpError> = None;

        loop {
            // Submit while the source has data, the window has room, and no
            // chunk has failed. Once a failure is observed, nothing further
            // is submitted.
            while failure.is_none() && !source_done && window.admits(chunk_size) {
                let chunk = match read_chunk(source, chunk_size as usize) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        for id in pending.keys() {
                            self.shared.abandon(*id);
                        }
                        return Err(err);
                    }
                };
                if chunk.is_empty() {
                    source_done = true;
                    break;
                }
                let len = chunk.len() as u32;
                if len < chunk_size {
                    source_done = true;
                }
                let packet = ClientPacket::Write {
                    handle: remote.clone(),
                    offset: next_offset,
                    data: chunk,
                };
                match self.shared.submit(&packet, tx.clone()) {
                    Ok(id) => {
                        pending.insert(id, (next_offset, len));
                        window.submitted(len);
                        next_offset += len as u64;
                    }
                    Err(err) => {
                        failure.get_or_insert(err);
                        break;
                    }
                }
            }

            if pending.is_empty() {
                break;
            }

            let completion = match next_completion(&self.shared, &rx, &options.cancel) {
                Ok(completion) => completion,
                Err(err) => {
                    // Local abort: withdraw in-flight slots and report as-is.
                    for id in pending.keys() {
                        self.shared.abandon(*id);
                    }
                    return Err(err);
                }
            };
            let packet = match completion {
                Completion::Response(packet) => packet,
                Completion::Failed(err) => {
                    failure.get_or_insert(err);
                    // Failed completions carry no request id; settle one
                    // in-flight slot so the drain terminates. `committed`
                    // only ever advances on confirmed chunks.
                    if let Some(&id) = pending.keys().next() {
                        if let Some((_, len)) = pending.remove(&id) {
                            window.completed(len);
                        }
                    }
                    continue;
                }
            };
            let Some(id) = packet.request_id() else {
                failure.get_or_insert(SftpError::UnexpectedResponse(packet.packet_name()));
                continue;
            };
            let Some((chunk_offset, len)) = pending.remove(&id) else {
                warn!("write pipeline got a completion it never issued (id {})", id);
                continue;
            };
            window.completed(len);

            match packet {
                ServerPacket::Status { code, message, .. } => {
                    match StatusCode::from_wire(code) {
                        StatusCode::Ok => {
                            trace!("write chunk at {} ({} bytes) confirmed", chunk_offset, len);
                            confirmed.insert(chunk_offset, len);
                            while let Some(len) = confirmed.remove(&committed) {
                                committed += len as u64;
                            }
                        }
                        other => {
                            debug!(
                                "write chunk at {} failed with {:?}; halting submission",
                                chunk_offset, other
                            );
                            failure.get_or_insert(SftpError::from_status(other, message));
                        }
                    }
                }
                other => {
                    failure.get_or_insert(SftpError::UnexpectedResponse(other.packet_name()));
                }
            }
        }

        match failure {
            None => {
                let total = next_offset - offset;
                debug!("pipelined write committed {} bytes", total);
                Ok(total)
            }
            Some(cause) => Err(SftpError::PartialWrite {
                committed: committed - offset,
                cause: Box::new(cause),
            }),
        }
    }
}

/// Reads up to `len` bytes from the source, tolerating short reads;
/// an empty result means end of input.
fn read_chunk(source: &mut impl Read, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_window_admits_up_to_limit() {
        let mut window = Window::new(PipelineWindow::Requests(2));
        assert!(window.admits(100));
        window.submitted(100);
        assert!(window.admits(100));
        window.submitted(100);
        assert!(!window.admits(100));
        window.completed(100);
        assert!(window.admits(100));
    }

    #[test]
    fn byte_window_admits_by_payload() {
        let mut window = Window::new(PipelineWindow::Bytes(1000));
        assert!(window.admits(600));
        window.submitted(600);
        assert!(window.admits(400));
        assert!(!window.admits(401));
        window.completed(600);
        assert!(window.admits(1000));
    }

    #[test]
    fn byte_window_admits_oversized_chunk_when_idle() {
        let window = Window::new(PipelineWindow::Bytes(10));
        assert!(window.admits(100));
    }

    #[test]
    fn read_chunk_handles_short_reads() {
        let mut source: &[u8] = b"hello";
        let chunk = read_chunk(&mut source, 3).unwrap();
        assert_eq!(chunk, b"hel");
        let chunk = read_chunk(&mut source, 3).unwrap();
        assert_eq!(chunk, b"lo");
        let chunk = read_chunk(&mut source, 3).unwrap();
        assert!(chunk.is_empty());
    }
}
