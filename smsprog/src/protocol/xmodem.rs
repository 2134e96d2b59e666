//! XMODEM transfer protocol.
//!
//! The programmer firmware speaks classic 128-byte XMODEM:
//!
//! ```text
//! +-----+-----+------+--------------+-----------------+
//! | SOH | SEQ | ~SEQ | DATA (128)   | SUM (1)/CRC (2) |
//! +-----+-----+------+--------------+-----------------+
//! ```
//!
//! Cartridge reads may use either trailer; the receiver picks one with its
//! start byte (NAK for the additive checksum, `C` for CRC16). Cartridge
//! writes only accept the checksum variant.

use {
    crate::{
        error::{Error, Result},
        protocol::crc::{checksum8, crc16_xmodem},
        transfer::{ByteChannel, TransferProtocol},
    },
    log::{debug, trace},
    std::{io::Write, time::Duration},
};

/// XMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Payload bytes per block.
pub const BLOCK_SIZE: usize = 128;

/// Filler for the last, partial block.
pub const PAD_BYTE: u8 = 0x1A;

/// Block trailer variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// One-byte additive checksum.
    Checksum,
    /// Big-endian CRC16-XMODEM.
    Crc16,
}

impl ChecksumMode {
    /// Byte the receiver sends to request this mode.
    pub fn start_byte(self) -> u8 {
        match self {
            Self::Checksum => control::NAK,
            Self::Crc16 => control::C,
        }
    }

    fn trailer_len(self) -> usize {
        match self {
            Self::Checksum => 1,
            Self::Crc16 => 2,
        }
    }

    /// Bytes following the SOH of a block.
    pub fn body_len(self) -> usize {
        2 + BLOCK_SIZE + self.trailer_len()
    }
}

/// XMODEM configuration options.
#[derive(Debug, Clone)]
pub struct XmodemConfig {
    /// Timeout for waiting for a character.
    pub char_timeout: Duration,
    /// Consecutive errors tolerated while receiving.
    pub receive_retries: u32,
    /// Attempts per block (and for the start request) while sending.
    pub send_retries: u32,
    /// Trailer requested when receiving.
    pub receive_mode: ChecksumMode,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        Self {
            char_timeout: Duration::from_secs(1),
            receive_retries: 102,
            send_retries: 10,
            receive_mode: ChecksumMode::Checksum,
        }
    }
}

/// XMODEM implementation of [`TransferProtocol`].
#[derive(Debug, Clone, Default)]
pub struct Xmodem {
    config: XmodemConfig,
}

impl Xmodem {
    /// XMODEM with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// XMODEM with custom settings.
    pub fn with_config(config: XmodemConfig) -> Self {
        Self { config }
    }

    /// Current settings.
    pub fn config(&self) -> &XmodemConfig {
        &self.config
    }

    /// Build a block; `data` shorter than a block is padded.
    pub fn build_block(seq: u8, data: &[u8], mode: ChecksumMode) -> Vec<u8> {
        let mut block = Vec::with_capacity(1 + mode.body_len());

        block.push(control::SOH);
        block.push(seq);
        block.push(!seq);

        let len = data.len().min(BLOCK_SIZE);
        block.extend_from_slice(&data[..len]);
        block.resize(3 + BLOCK_SIZE, PAD_BYTE);

        let payload = &block[3..];
        match mode {
            ChecksumMode::Checksum => {
                let sum = checksum8(payload);
                block.push(sum);
            },
            ChecksumMode::Crc16 => {
                let crc = crc16_xmodem(payload);
                block.extend_from_slice(&crc.to_be_bytes());
            },
        }

        block
    }

    /// Validate a block body (everything after SOH).
    ///
    /// Returns the sequence number and payload if framing and trailer check out.
    pub fn parse_block(body: &[u8], mode: ChecksumMode) -> Option<(u8, &[u8])> {
        if body.len() != mode.body_len() {
            return None;
        }
        let seq = body[0];
        if body[1] != !seq {
            return None;
        }
        let payload = &body[2..2 + BLOCK_SIZE];
        let trailer = &body[2 + BLOCK_SIZE..];
        let valid = match mode {
            ChecksumMode::Checksum => trailer[0] == checksum8(payload),
            ChecksumMode::Crc16 => {
                u16::from_be_bytes([trailer[0], trailer[1]]) == crc16_xmodem(payload)
            },
        };
        valid.then_some((seq, payload))
    }

    fn read_byte(&self, channel: &mut dyn ByteChannel) -> Result<Option<u8>> {
        Ok(channel
            .read_bytes(1, self.config.char_timeout)?
            .first()
            .copied())
    }

    fn write_byte(&self, channel: &mut dyn ByteChannel, byte: u8) -> Result<()> {
        channel.write_bytes(&[byte], self.config.char_timeout)?;
        Ok(())
    }

    /// Wait for the receiver to request the transfer.
    fn wait_for_start(&self, channel: &mut dyn ByteChannel) -> Result<ChecksumMode> {
        debug!("Waiting for receiver start request...");
        for _ in 0..self.config.send_retries {
            match self.read_byte(channel)? {
                Some(control::NAK) => return Ok(ChecksumMode::Checksum),
                Some(control::C) => return Ok(ChecksumMode::Crc16),
                Some(control::CAN) => {
                    return Err(Error::Transfer("Transfer cancelled by receiver".into()));
                },
                Some(c) => trace!("Ignoring 0x{c:02X} while waiting for start"),
                None => {},
            }
        }
        Err(Error::Transfer(
            "Receiver did not request the transfer".into(),
        ))
    }

    /// Send a block and wait for ACK.
    fn send_block(&self, channel: &mut dyn ByteChannel, block: &[u8]) -> Result<()> {
        for retry in 0..self.config.send_retries {
            trace!("Sending block {} (attempt {})", block[1], retry + 1);
            channel.write_bytes(block, self.config.char_timeout)?;

            match self.read_byte(channel)? {
                Some(control::ACK) => return Ok(()),
                Some(control::NAK) => debug!("Block {} NAKed, retrying...", block[1]),
                Some(control::CAN) => {
                    return Err(Error::Transfer("Transfer cancelled by receiver".into()));
                },
                Some(c) => debug!("Unexpected response: 0x{c:02X}, retrying..."),
                None => debug!("Timeout waiting for ACK, retrying..."),
            }
        }

        Err(Error::Transfer(format!(
            "Block {} failed after {} retries",
            block[1], self.config.send_retries
        )))
    }

    fn send_eot(&self, channel: &mut dyn ByteChannel) -> Result<()> {
        debug!("Sending EOT");
        for _ in 0..self.config.send_retries {
            self.write_byte(channel, control::EOT)?;
            if self.read_byte(channel)? == Some(control::ACK) {
                return Ok(());
            }
        }
        Err(Error::Transfer("EOT was not acknowledged".into()))
    }
}

impl TransferProtocol for Xmodem {
    fn receive(&mut self, channel: &mut dyn ByteChannel, sink: &mut dyn Write) -> Result<usize> {
        let mode = self.config.receive_mode;
        let mut expected: u8 = 1;
        let mut received = 0usize;
        let mut errors = 0u32;
        let mut started = false;

        debug!("XMODEM receive ({mode:?})");
        self.write_byte(channel, mode.start_byte())?;

        loop {
            if errors > self.config.receive_retries {
                let _ = channel.write_bytes(&[control::CAN, control::CAN], self.config.char_timeout);
                return Err(Error::Transfer(format!(
                    "Receive failed after {} errors at block {expected}",
                    self.config.receive_retries
                )));
            }

            match self.read_byte(channel)? {
                Some(control::SOH) => {
                    let body = channel.read_bytes(mode.body_len(), self.config.char_timeout)?;
                    match Self::parse_block(&body, mode) {
                        Some((seq, payload)) if seq == expected => {
                            sink.write_all(payload)?;
                            received += payload.len();
                            expected = expected.wrapping_add(1);
                            started = true;
                            errors = 0;
                            self.write_byte(channel, control::ACK)?;
                        },
                        Some((seq, _)) if started && seq == expected.wrapping_sub(1) => {
                            debug!("Duplicate block {seq}, acknowledging");
                            self.write_byte(channel, control::ACK)?;
                        },
                        Some((seq, _)) => {
                            let _ = channel
                                .write_bytes(&[control::CAN, control::CAN], self.config.char_timeout);
                            return Err(Error::Transfer(format!(
                                "Out of sequence block {seq}, expected {expected}"
                            )));
                        },
                        None => {
                            errors += 1;
                            debug!("Bad block (expected {expected}), sending NAK");
                            self.write_byte(channel, control::NAK)?;
                        },
                    }
                },
                Some(control::EOT) => {
                    self.write_byte(channel, control::ACK)?;
                    debug!("XMODEM receive complete: {received} bytes");
                    return Ok(received);
                },
                Some(control::CAN) => {
                    return Err(Error::Transfer("Transfer cancelled by sender".into()));
                },
                Some(c) => {
                    trace!("Ignoring 0x{c:02X} between blocks");
                    errors += 1;
                },
                None => {
                    errors += 1;
                    let retry = if started {
                        control::NAK
                    } else {
                        mode.start_byte()
                    };
                    trace!("Timeout waiting for block {expected}, sending 0x{retry:02X}");
                    self.write_byte(channel, retry)?;
                },
            }
        }
    }

    fn send(
        &mut self,
        channel: &mut dyn ByteChannel,
        data: &[u8],
        receiver_ready: bool,
    ) -> Result<usize> {
        let mode = if receiver_ready {
            ChecksumMode::Checksum
        } else {
            self.wait_for_start(channel)?
        };
        debug!(
            "XMODEM send ({mode:?}): {} bytes in {} blocks",
            data.len(),
            data.len().div_ceil(BLOCK_SIZE)
        );

        let mut seq: u8 = 1;
        for chunk in data.chunks(BLOCK_SIZE) {
            let block = Self::build_block(seq, chunk, mode);
            self.send_block(channel, &block)?;
            seq = seq.wrapping_add(1);
        }

        self.send_eot(channel)?;
        debug!("XMODEM send complete");
        Ok(data.len())
    }
}
