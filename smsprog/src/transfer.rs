//! Bulk transfer adapter.
//!
//! Cartridge contents move with a packetized transfer protocol. This module
//! owns the parts that are specific to the programmer: how a transfer is
//! started ([`Initiation`]) and the timed byte primitives ([`ByteChannel`])
//! handed to the protocol implementation, with progress accounting. Packet
//! framing, checksums and retries belong to the [`TransferProtocol`].

use {
    crate::{
        cancel::CancelToken,
        error::{Error, Result},
        port::Port,
        protocol::{
            exchange::{CommandChannel, Terminator},
            response::{DOWNLOAD_READY, UPLOAD_READY},
        },
    },
    log::{debug, info},
    std::{
        fmt,
        io::{ErrorKind, Read, Write},
        str::FromStr,
        time::{Duration, Instant},
    },
};

/// Progress is reported once more than this many bytes accumulated.
pub const PROGRESS_STEP: usize = 1024;

/// Command that starts a cartridge read.
pub const DOWNLOAD_COMMAND: &str = "dx";

/// Command that starts a cartridge write.
pub const UPLOAD_COMMAND: &str = "ux";

/// NAK sent by the firmware when it is ready to receive.
const NAK: char = '\u{15}';

/// Transfer direction, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Direction {
    /// Device to host.
    Download,
    /// Host to device.
    Upload,
}

/// Progress callback: direction and cumulative byte count.
pub type ProgressFn = dyn FnMut(Direction, usize) + Send;

/// Timed byte primitives for a transfer protocol.
pub trait ByteChannel {
    /// Read up to `size` bytes, waiting at most `timeout`.
    ///
    /// Returns fewer bytes, possibly none, when the timeout expires.
    fn read_bytes(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Write `data`, returning the number of bytes written.
    fn write_bytes(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;
}

/// Packetized transfer protocol driven over a [`ByteChannel`].
pub trait TransferProtocol: Send {
    /// Receive a stream into `sink`, returning the number of payload bytes.
    fn receive(&mut self, channel: &mut dyn ByteChannel, sink: &mut dyn Write) -> Result<usize>;

    /// Send `data`, returning the number of payload bytes.
    ///
    /// `receiver_ready` is set when the receiver's start request was already
    /// consumed while initiating the transfer.
    fn send(
        &mut self,
        channel: &mut dyn ByteChannel,
        data: &[u8],
        receiver_ready: bool,
    ) -> Result<usize>;
}

/// How the firmware announces it is ready for an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadHandshake {
    /// Text banner `READY. Please start uploading.` (older firmware).
    ReadyPrompt,
    /// A NAK byte at the end of the answer (newer firmware).
    #[default]
    Nak,
}

impl UploadHandshake {
    /// Terminator of the `ux` answer.
    pub fn terminator(self) -> Terminator {
        match self {
            Self::ReadyPrompt => Terminator::contains(UPLOAD_READY),
            Self::Nak => Terminator::ends_with(NAK),
        }
    }

    /// Whether waiting for the answer consumes the receiver's start request.
    pub fn consumes_start_request(self) -> bool {
        matches!(self, Self::Nak)
    }
}

impl fmt::Display for UploadHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadyPrompt => f.write_str("ready"),
            Self::Nak => f.write_str("nak"),
        }
    }
}

impl FromStr for UploadHandshake {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ready" | "ready-prompt" | "prompt" => Ok(Self::ReadyPrompt),
            "nak" => Ok(Self::Nak),
            other => Err(Error::Protocol(format!(
                "unknown upload handshake '{other}' (expected 'nak' or 'ready')"
            ))),
        }
    }
}

/// Command and expected answer that start a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initiation {
    /// Command sent to the firmware.
    pub command: String,
    /// End of the firmware's answer.
    pub terminator: Terminator,
    /// Whether the receiver's start request is consumed by the answer.
    pub receiver_ready: bool,
}

impl Initiation {
    /// Cartridge read.
    pub fn download() -> Self {
        Self {
            command: DOWNLOAD_COMMAND.to_string(),
            terminator: Terminator::contains(DOWNLOAD_READY),
            receiver_ready: false,
        }
    }

    /// Cartridge write with the given handshake.
    pub fn upload(handshake: UploadHandshake) -> Self {
        Self {
            command: UPLOAD_COMMAND.to_string(),
            terminator: handshake.terminator(),
            receiver_ready: handshake.consumes_start_request(),
        }
    }

    /// Whether the receiver's start request is already spent once `answer`
    /// was read.
    ///
    /// With a text banner the firmware sends its first NAK right behind it,
    /// often in the same read.
    pub fn start_request_seen(&self, answer: &str) -> bool {
        if self.receiver_ready {
            return true;
        }
        match &self.terminator {
            Terminator::Contains(banner) => answer
                .find(banner.as_str())
                .is_some_and(|at| answer[at + banner.len()..].contains(NAK)),
            Terminator::EndsWith(_) => false,
        }
    }
}

/// Byte counters of one transfer, kept per direction.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    received: usize,
    received_reported: usize,
    sent: usize,
    sent_reported: usize,
}

impl TransferProgress {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero all counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Bytes moved in `direction` so far.
    pub fn total(&self, direction: Direction) -> usize {
        match direction {
            Direction::Download => self.received,
            Direction::Upload => self.sent,
        }
    }

    /// Count `bytes`; returns the new total when a report is due.
    pub fn record(&mut self, direction: Direction, bytes: usize) -> Option<usize> {
        let (total, reported) = match direction {
            Direction::Download => (&mut self.received, &mut self.received_reported),
            Direction::Upload => (&mut self.sent, &mut self.sent_reported),
        };
        *total += bytes;
        if *total - *reported > PROGRESS_STEP {
            *reported = *total;
            Some(*total)
        } else {
            None
        }
    }
}

/// [`ByteChannel`] bound to a port for the duration of one transfer.
pub struct TransferAdapter<'a, P: Port> {
    port: &'a mut P,
    cancel: &'a CancelToken,
    direction: Direction,
    progress: TransferProgress,
    callback: Option<&'a mut ProgressFn>,
}

impl<'a, P: Port> TransferAdapter<'a, P> {
    /// Start a transfer with fresh counters.
    pub fn new(port: &'a mut P, cancel: &'a CancelToken, direction: Direction) -> Self {
        Self {
            port,
            cancel,
            direction,
            progress: TransferProgress::new(),
            callback: None,
        }
    }

    /// Report progress to `callback`.
    #[must_use]
    pub fn with_progress(mut self, callback: Option<&'a mut ProgressFn>) -> Self {
        self.callback = callback;
        self
    }

    /// Main direction of this transfer.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Counters so far.
    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    fn record(&mut self, direction: Direction, bytes: usize) {
        if let Some(total) = self.progress.record(direction, bytes) {
            if let Some(callback) = self.callback.as_mut() {
                callback(direction, total);
            }
        }
    }
}

impl<P: Port> ByteChannel for TransferAdapter<'_, P> {
    fn read_bytes(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut data = Vec::with_capacity(size);
        let mut buf = vec![0u8; size];

        while data.len() < size {
            self.cancel.check()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.port.set_timeout(remaining)?;
            match self.port.read(&mut buf[..size - data.len()]) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
                Err(e) => return Err(Error::Connection(e)),
            }
        }

        self.record(Direction::Download, data.len());
        Ok(data)
    }

    fn write_bytes(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        self.cancel.check()?;
        self.port.set_timeout(timeout)?;
        self.port
            .write_all_bytes(data)
            .map_err(Error::Connection)?;
        self.record(Direction::Upload, data.len());
        Ok(data.len())
    }
}

/// Start a download with `initiation` and receive it into `sink`.
pub fn download<P: Port>(
    channel: &mut CommandChannel<P>,
    initiation: &Initiation,
    protocol: &mut dyn TransferProtocol,
    sink: &mut dyn Write,
    progress: Option<&mut ProgressFn>,
) -> Result<usize> {
    info!("Starting download");
    channel.exchange(&initiation.command, &initiation.terminator)?;

    let cancel = channel
        .cancel_token()
        .clone();
    let mut adapter =
        TransferAdapter::new(channel.port_mut(), &cancel, Direction::Download).with_progress(progress);
    let received = protocol.receive(&mut adapter, sink)?;
    debug!(
        "Download finished: {received} bytes ({} bytes on the wire)",
        adapter
            .progress()
            .total(Direction::Download)
    );
    Ok(received)
}

/// Start an upload with `initiation` and send `data`.
pub fn upload<P: Port>(
    channel: &mut CommandChannel<P>,
    initiation: &Initiation,
    protocol: &mut dyn TransferProtocol,
    data: &[u8],
    progress: Option<&mut ProgressFn>,
) -> Result<usize> {
    info!("Starting upload of {} bytes", data.len());
    let answer = channel.exchange(&initiation.command, &initiation.terminator)?;
    let receiver_ready = initiation.start_request_seen(&answer);
    if receiver_ready && !initiation.receiver_ready {
        debug!("Start request arrived with the upload banner");
    }

    let cancel = channel
        .cancel_token()
        .clone();
    let mut adapter =
        TransferAdapter::new(channel.port_mut(), &cancel, Direction::Upload).with_progress(progress);
    let sent = protocol.send(&mut adapter, data, receiver_ready)?;
    debug!(
        "Upload finished: {sent} bytes ({} bytes on the wire)",
        adapter
            .progress()
            .total(Direction::Upload)
    );
    Ok(sent)
}
