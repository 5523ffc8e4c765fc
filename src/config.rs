use std::time::Duration;

use crate::constants::SFTP_SUPPORTED_VERSION;

/// Bound on how much a transfer may have outstanding at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineWindow {
    /// Maximum number of unacknowledged requests.
    Requests(usize),
    /// Maximum payload bytes across unacknowledged requests.
    Bytes(u64),
}

/// Wire overhead allowance per packet: length prefix, type, request id,
/// handle string and offsets, rounded up generously.
const PACKET_OVERHEAD: u32 = 1024;

/// Session tuning knobs. The defaults suit an interactive client against a
/// stock OpenSSH server; transfers mostly care about `chunk_size` and
/// `window`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Protocol version offered during the handshake.
    pub version: u32,
    /// Payload bytes per READ/WRITE request.
    pub chunk_size: u32,
    /// Pipelining bound for the transfer engine.
    pub window: PipelineWindow,
    /// Per-wait timeout for request completions; `None` disables it.
    pub operation_timeout: Option<Duration>,
    /// How long a graceful close waits for in-flight requests to drain.
    pub close_grace: Duration,
    /// Largest frame the reader loop will accept before declaring the
    /// stream corrupt.
    pub max_packet_size: u32,
    /// OpenSSH's sftp-server swaps the SYMLINK argument order relative to
    /// the draft; on by default since most servers are OpenSSH.
    pub openssh_symlink_order: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            version: SFTP_SUPPORTED_VERSION,
            chunk_size: 32 * 1024,
            window: PipelineWindow::Requests(32),
            operation_timeout: Some(Duration::from_secs(30)),
            close_grace: Duration::from_secs(5),
            max_packet_size: 256 * 1024,
            openssh_symlink_order: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_size(mut self, bytes: u32) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn window(mut self, window: PipelineWindow) -> Self {
        self.window = window;
        self
    }

    pub fn operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn max_packet_size(mut self, bytes: u32) -> Self {
        self.max_packet_size = bytes;
        self
    }

    /// Chunk size clamped so one READ/WRITE frame stays inside the maximum
    /// packet size.
    pub(crate) fn effective_chunk_size(&self) -> u32 {
        self.chunk_size
            .min(self.max_packet_size.saturating_sub(PACKET_OVERHEAD))
            .max(1)
    }
}
