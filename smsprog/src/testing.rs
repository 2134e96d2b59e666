//! In-memory port for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;
use crate::protocol::xmodem::{BLOCK_SIZE, ChecksumMode, Xmodem, control};
use crate::rom::ERASED;

/// `init` answer for a writable cartridge.
pub(crate) const INIT_FLASH: &str = "ROM size set to 32768\r\n\
    Cartridge type: FLASH. Manufacturer ID=0xc2, Device=0xa4 => MX29F040 (supported)";

/// `init` answer for a flash chip the firmware does not know.
pub(crate) const INIT_UNSUPPORTED: &str =
    "Cartridge type: FLASH. Manufacturer ID=0x01, Device=0x20 =>  (unknown/unsupported)";

/// `init` answer for a mask ROM cartridge.
pub(crate) const INIT_ROM: &str = "ROM size set to 32768\r\nCartridge type: ROM";

/// What the fake device does in response to one write.
pub(crate) enum Reply {
    /// Nothing.
    Silent,
    /// Make these chunks readable, one read call per chunk at most.
    Chunks(Vec<Vec<u8>>),
    /// Fail every following read and write.
    Disconnect,
}

impl Reply {
    pub(crate) fn text(s: &str) -> Self {
        Self::Chunks(vec![s.as_bytes().to_vec()])
    }

    pub(crate) fn bytes(b: &[u8]) -> Self {
        Self::Chunks(vec![b.to_vec()])
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Reply + Send>;

/// Port driven by a responder closure that sees every write.
pub(crate) struct ScriptedPort {
    rx: VecDeque<Vec<u8>>,
    pub(crate) written: Vec<u8>,
    lines: Vec<String>,
    pub(crate) clears: usize,
    responder: Responder,
    disconnected: bool,
    timeout: Duration,
}

impl ScriptedPort {
    pub(crate) fn new(responder: impl FnMut(&[u8]) -> Reply + Send + 'static) -> Self {
        Self {
            rx: VecDeque::new(),
            written: Vec::new(),
            lines: Vec::new(),
            clears: 0,
            responder: Box::new(responder),
            disconnected: false,
            timeout: Duration::from_millis(100),
        }
    }

    /// Fake programmer answering command lines from a table; unknown
    /// commands get the bare prompt. Answers are not echoed.
    pub(crate) fn programmer(table: &'static [(&'static str, &'static str)]) -> Self {
        Self::new(move |data| {
            let Some(line) = command_line(data) else {
                return Reply::Silent;
            };
            let body = table
                .iter()
                .find(|(cmd, _)| *cmd == line)
                .map_or("", |(_, answer)| answer);
            Reply::text(&format!("{body}\r\n> "))
        })
    }

    /// Queue bytes to be read before anything else.
    pub(crate) fn preload(&mut self, data: &[u8]) {
        self.rx.push_back(data.to_vec());
    }

    /// Command lines written so far, without line endings.
    pub(crate) fn commands(&self) -> &[String] {
        &self.lines
    }
}

/// Extract the command from a `cmd\r\n` write.
pub(crate) fn command_line(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    let line = text.strip_suffix("\r\n")?;
    line.chars()
        .all(|c| c.is_ascii_graphic() || c == ' ')
        .then(|| line.to_string())
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected")
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.disconnected {
            return Err(gone());
        }
        let Some(chunk) = self.rx.front_mut() else {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        };
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.rx.pop_front();
        }
        Ok(n)
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.disconnected {
            return Err(gone());
        }
        self.written.extend_from_slice(buf);
        if let Some(line) = command_line(buf) {
            self.lines.push(line);
        }
        match (self.responder)(buf) {
            Reply::Silent => {},
            Reply::Chunks(chunks) => self.rx.extend(chunks.into_iter().filter(|c| !c.is_empty())),
            Reply::Disconnect => self.disconnected = true,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for ScriptedPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_input(&mut self) -> Result<()> {
        self.clears += 1;
        self.rx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn close(&mut self) -> Result<()> {
        self.disconnected = true;
        Ok(())
    }
}

enum CartState {
    Idle,
    Sending { blocks: VecDeque<Vec<u8>>, eot_sent: bool },
    Receiving { offset: usize },
}

/// Programmer with a cartridge behind it, speaking checksum XMODEM.
pub(crate) struct FakeCartridge {
    pub(crate) memory: Arc<Mutex<Vec<u8>>>,
    init: &'static str,
    version: Option<&'static str>,
}

impl FakeCartridge {
    pub(crate) fn new(init: &'static str, memory: Vec<u8>) -> Self {
        Self {
            memory: Arc::new(Mutex::new(memory)),
            init,
            version: None,
        }
    }

    /// Answer `version` with `Version: <version>`.
    pub(crate) fn with_version(mut self, version: &'static str) -> Self {
        self.version = Some(version);
        self
    }

    pub(crate) fn port(&self) -> ScriptedPort {
        let memory = Arc::clone(&self.memory);
        let init = self.init;
        let version = self.version;
        let mut read_size = memory.lock().unwrap().len();
        let mut state = CartState::Idle;

        ScriptedPort::new(move |data| {
            if let Some(line) = command_line(data) {
                let mut mem = memory.lock().unwrap();
                let body = match line.as_str() {
                    "" => String::new(),
                    "init" => {
                        read_size = mem.len();
                        init.to_string()
                    },
                    "version" => version.map_or_else(String::new, |v| format!("version\r\nVersion: {v}")),
                    "ce" => {
                        mem.fill(ERASED);
                        "Erasing... done".to_string()
                    },
                    "bc" => {
                        let blank = mem.iter().all(|&b| b == ERASED);
                        format!("Cartridge is blank: {}", if blank { "YES" } else { "NO" })
                    },
                    "dx" => {
                        let size = read_size.min(mem.len());
                        let blocks = mem[..size]
                            .chunks(BLOCK_SIZE)
                            .enumerate()
                            .map(|(i, chunk)| {
                                Xmodem::build_block((i + 1) as u8, chunk, ChecksumMode::Checksum)
                            })
                            .collect();
                        state = CartState::Sending {
                            blocks,
                            eot_sent: false,
                        };
                        return Reply::text("Please start the download... CTRL+C to cancel.\r\n");
                    },
                    "ux" => {
                        state = CartState::Receiving { offset: 0 };
                        return Reply::text("READY. Please start uploading.\r\n\u{15}");
                    },
                    other => match other
                        .strip_prefix("setromsize ")
                        .and_then(|n| n.parse::<usize>().ok())
                    {
                        Some(size) => {
                            read_size = size;
                            format!("ROM size set to {size}")
                        },
                        None => "ERROR".to_string(),
                    },
                };
                return Reply::text(&format!("{body}\r\n> "));
            }

            match &mut state {
                CartState::Sending { blocks, eot_sent } => match data {
                    [control::NAK] | [control::ACK] => {
                        if let Some(block) = blocks.pop_front() {
                            Reply::bytes(&block)
                        } else if !*eot_sent {
                            *eot_sent = true;
                            Reply::bytes(&[control::EOT])
                        } else {
                            state = CartState::Idle;
                            Reply::Silent
                        }
                    },
                    _ => Reply::Silent,
                },
                CartState::Receiving { offset } => {
                    if data == [control::EOT] {
                        state = CartState::Idle;
                        return Reply::bytes(&[control::ACK]);
                    }
                    match Xmodem::parse_block(data.get(1..).unwrap_or_default(), ChecksumMode::Checksum) {
                        Some((_, payload)) if data[0] == control::SOH => {
                            let mut mem = memory.lock().unwrap();
                            let end = *offset + payload.len();
                            if mem.len() < end {
                                mem.resize(end, ERASED);
                            }
                            mem[*offset..end].copy_from_slice(payload);
                            *offset = end;
                            Reply::bytes(&[control::ACK])
                        },
                        _ => Reply::bytes(&[control::NAK]),
                    }
                },
                CartState::Idle => Reply::Silent,
            }
        })
    }
}
