//! Cartridge workflows.
//!
//! Each workflow resynchronizes with the prompt and asks the firmware to
//! `init` the cartridge before doing anything else. Write operations refuse
//! to touch a cartridge unless `init` reported a supported flash chip.

use {
    crate::{
        capabilities::Capability,
        error::{Error, Result},
        port::Port,
        protocol::{
            exchange::{ExchangeOutcome, Terminator},
            response,
        },
        rom::count_non_blank,
        session::Session,
    },
    log::{debug, info, warn},
};

/// Kind of cartridge reported by `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase", tag = "type"))]
pub enum CartridgeKind {
    /// Mask ROM, read only.
    Rom,
    /// Flash cartridge.
    Flash {
        /// The firmware knows how to program this chip.
        supported: bool,
    },
    /// No cartridge type line.
    Unknown,
}

impl CartridgeKind {
    /// Whether the cartridge can be erased and programmed.
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Flash { supported: true })
    }
}

/// Parsed `init` answer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CartridgeInfo {
    /// Cartridge kind.
    pub kind: CartridgeKind,
    /// Flash chip name, e.g. `MX29F040`.
    pub chip: Option<String>,
    /// Size the next read will return, as detected by `init`.
    pub rom_size: Option<u32>,
    /// Full answer text.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub raw: String,
}

impl CartridgeInfo {
    /// Parse the answer to `init`.
    pub fn parse(response: &str) -> Self {
        let kind = if response::is_flash_cartridge(response) {
            CartridgeKind::Flash {
                supported: response::is_supported_flash(response),
            }
        } else if response::is_rom_cartridge(response) {
            CartridgeKind::Rom
        } else {
            CartridgeKind::Unknown
        };
        Self {
            kind,
            chip: response::parse_chip(response),
            rom_size: response::parse_rom_size(response),
            raw: response.to_string(),
        }
    }
}

/// Result of comparing a read-back with the expected image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Same length, same bytes.
    Match,
    /// The read-back is longer but starts with the expected image.
    PrefixMatch {
        /// Bytes past the end of the expected image.
        extra: usize,
    },
    /// First differing byte.
    Mismatch {
        /// Offset of the difference.
        offset: usize,
    },
    /// The read-back ended early.
    TooShort {
        /// Expected length.
        expected: usize,
        /// Read-back length.
        actual: usize,
    },
}

impl VerifyOutcome {
    /// Whether the cartridge holds the expected image.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Match | Self::PrefixMatch { .. })
    }
}

/// Compare `readback` against `expected`.
///
/// Without `setromsize` the firmware reads as much as it detected, so a
/// longer read-back only has to match on the expected length.
pub fn verify(expected: &[u8], readback: &[u8]) -> VerifyOutcome {
    if readback.len() < expected.len() {
        return VerifyOutcome::TooShort {
            expected: expected.len(),
            actual: readback.len(),
        };
    }
    if let Some(offset) = expected
        .iter()
        .zip(readback)
        .position(|(a, b)| a != b)
    {
        return VerifyOutcome::Mismatch { offset };
    }
    match readback.len() - expected.len() {
        0 => VerifyOutcome::Match,
        extra => VerifyOutcome::PrefixMatch { extra },
    }
}

/// Blank check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankStatus {
    /// Answer of the on-device `bc` command.
    Device {
        /// Cartridge reported blank.
        blank: bool,
    },
    /// Computed from a full read.
    Readback {
        /// Bytes that are not 0xFF.
        non_blank_bytes: usize,
        /// Bytes read.
        size: usize,
    },
}

impl BlankStatus {
    /// Whether the cartridge is blank.
    pub fn is_blank(self) -> bool {
        match self {
            Self::Device { blank } => blank,
            Self::Readback { non_blank_bytes, .. } => non_blank_bytes == 0,
        }
    }
}

impl<P: Port> Session<P> {
    fn init(&mut self) -> Result<String> {
        self.channel.resync()?;
        self.channel.command("init")
    }

    /// `init`, failing unless the cartridge can be written.
    fn init_writable(&mut self) -> Result<CartridgeInfo> {
        let info = CartridgeInfo::parse(&self.init()?);
        match info.kind {
            CartridgeKind::Flash { supported: true } => Ok(info),
            CartridgeKind::Flash { supported: false } => Err(Error::CartridgeType(
                "flash chip is unknown or unsupported".into(),
            )),
            CartridgeKind::Rom | CartridgeKind::Unknown => Err(Error::CartridgeType(
                "cartridge is not flash based".into(),
            )),
        }
    }

    /// Identify the inserted cartridge.
    pub fn cartridge_info(&mut self) -> Result<CartridgeInfo> {
        let info = CartridgeInfo::parse(&self.init()?);
        debug!("Cartridge: {:?}", info.kind);
        Ok(info)
    }

    /// Read the whole cartridge.
    pub fn read_rom(&mut self) -> Result<Vec<u8>> {
        let info = self.cartridge_info()?;
        info!("Reading cartridge ({:?})", info.kind);

        let mut rom = Vec::with_capacity(info.rom_size.unwrap_or(0) as usize);
        self.download(&mut rom)?;
        self.channel.command("")?;
        Ok(rom)
    }

    /// Erase a flash cartridge.
    pub fn chip_erase(&mut self) -> Result<()> {
        self.init_writable()?;
        info!("Erasing cartridge, this can take a while");
        self.channel.command("ce")?;
        self.channel.command("")?;
        Ok(())
    }

    /// Program `data` without erasing first.
    pub fn program(&mut self, data: &[u8]) -> Result<()> {
        self.init_writable()?;
        self.upload(data)?;
        self.channel.command("")?;
        Ok(())
    }

    /// Erase the cartridge, then program `data`.
    pub fn erase_and_program(&mut self, data: &[u8]) -> Result<()> {
        self.init_writable()?;
        info!("Erasing cartridge, this can take a while");
        self.channel.command("ce")?;
        self.upload(data)?;
        self.channel.command("")?;
        Ok(())
    }

    /// Ask the firmware whether the cartridge is blank.
    pub fn blank_check(&mut self) -> Result<bool> {
        self.require(Capability::BlankCheck)?;
        self.init()?;
        let answer = self.channel.command(Capability::BlankCheck.command())?;
        Ok(response::is_blank(&answer))
    }

    /// Blank check that falls back to reading the cartridge on old firmware.
    pub fn blank_status(&mut self) -> Result<BlankStatus> {
        if self
            .capabilities()?
            .supports(Capability::BlankCheck)
        {
            return Ok(BlankStatus::Device {
                blank: self.blank_check()?,
            });
        }

        warn!("Firmware has no blank check command, reading the whole cartridge");
        let rom = self.read_rom()?;
        Ok(BlankStatus::Readback {
            non_blank_bytes: count_non_blank(&rom),
            size: rom.len(),
        })
    }

    /// Make the next read return exactly `size` bytes.
    pub fn set_rom_size(&mut self, size: usize) -> Result<()> {
        self.require(Capability::SetRomSize)?;
        let answer = self
            .channel
            .command(&format!("setromsize {size}"))?;
        if response::is_error(&answer) {
            return Err(Error::Protocol(format!(
                "firmware rejected ROM size {size}"
            )));
        }
        Ok(())
    }

    /// Read the cartridge back and compare it with `expected`.
    pub fn verify_cartridge(&mut self, expected: &[u8]) -> Result<VerifyOutcome> {
        self.channel.resync()?;
        if self
            .capabilities()?
            .supports(Capability::SetRomSize)
        {
            self.set_rom_size(expected.len())?;
        } else {
            warn!("Firmware does not support 'setromsize', verify will read the whole cartridge");
            self.init()?;
        }

        let mut readback = Vec::with_capacity(expected.len());
        self.download(&mut readback)?;
        self.channel.command("")?;

        let outcome = verify(expected, &readback);
        match outcome {
            VerifyOutcome::Match | VerifyOutcome::PrefixMatch { .. } => info!("Verify OK"),
            other => warn!("Verify failed: {other:?}"),
        }
        Ok(outcome)
    }

    /// Reset the programmer into its USB bootloader.
    ///
    /// The device dropping off the bus is the expected outcome.
    pub fn enter_bootloader(&mut self) -> Result<ExchangeOutcome> {
        self.channel.resync()?;
        let settle = self.config().bootloader_settle;
        let outcome = self
            .channel
            .exchange_expecting_disconnect("bootloader", &Terminator::prompt(), settle)?;
        if let ExchangeOutcome::Answered(ref text) = outcome {
            warn!("Programmer answered instead of resetting: {}", text.trim());
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCartridge, INIT_FLASH, INIT_ROM, INIT_UNSUPPORTED, Reply, ScriptedPort, command_line};
    use crate::transfer::UploadHandshake;
    use std::time::Duration;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_verify_prefix_rule() {
        assert_eq!(verify(b"ABC", b"ABC"), VerifyOutcome::Match);
        assert_eq!(
            verify(b"ABC", b"ABCXY"),
            VerifyOutcome::PrefixMatch { extra: 2 }
        );
        assert_eq!(
            verify(b"ABC", b"AB"),
            VerifyOutcome::TooShort {
                expected: 3,
                actual: 2
            }
        );
        assert_eq!(verify(b"ABC", b"ABZ"), VerifyOutcome::Mismatch { offset: 2 });
        assert!(!verify(b"ABC", b"ABZXY").is_ok());
        assert!(verify(b"", b"").is_ok());
    }

    #[test]
    fn test_cartridge_info_parse() {
        let info = CartridgeInfo::parse(INIT_FLASH);
        assert_eq!(info.kind, CartridgeKind::Flash { supported: true });
        assert_eq!(info.chip.as_deref(), Some("MX29F040"));
        assert_eq!(info.rom_size, Some(32768));
        assert!(info.kind.is_writable());

        let info = CartridgeInfo::parse(INIT_UNSUPPORTED);
        assert_eq!(info.kind, CartridgeKind::Flash { supported: false });
        assert!(!info.kind.is_writable());

        assert_eq!(CartridgeInfo::parse(INIT_ROM).kind, CartridgeKind::Rom);
        assert_eq!(CartridgeInfo::parse("\r\n> ").kind, CartridgeKind::Unknown);
    }

    #[test]
    fn test_write_operations_refuse_non_writable_cartridges() {
        for init in [INIT_ROM, INIT_UNSUPPORTED] {
            let cart = FakeCartridge::new(init, image(256));
            let mut session = Session::new(cart.port());
            assert!(matches!(session.chip_erase(), Err(Error::CartridgeType(_))));
            assert!(matches!(
                session.program(&[0u8; 128]),
                Err(Error::CartridgeType(_))
            ));
            assert!(matches!(
                session.erase_and_program(&[0u8; 128]),
                Err(Error::CartridgeType(_))
            ));

            let commands = session.channel().port().commands();
            assert!(commands.iter().all(|c| c != "ce" && c != "ux"));
            assert_eq!(*cart.memory.lock().unwrap(), image(256));
        }
    }

    #[test]
    fn test_read_rom() {
        let rom = image(32 * 1024);
        let cart = FakeCartridge::new(INIT_ROM, rom.clone());
        let mut session = Session::new(cart.port());

        assert_eq!(session.read_rom().unwrap(), rom);
        assert_eq!(
            session.channel().port().commands(),
            ["", "", "init", "dx", ""]
        );
    }

    #[test]
    fn test_read_reports_progress() {
        use std::sync::{Arc, Mutex};

        let cart = FakeCartridge::new(INIT_ROM, image(8 * 1024));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut session =
            Session::new(cart.port()).with_progress(move |_, bytes| sink.lock().unwrap().push(bytes));

        session.read_rom().unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_erase_and_program_then_verify() {
        let cart = FakeCartridge::new(INIT_FLASH, vec![0u8; 2048]).with_version("1.3");
        let data = image(1024);
        let mut session = Session::new(cart.port());

        session.erase_and_program(&data).unwrap();
        assert_eq!(
            session.channel().port().commands(),
            ["", "", "init", "ce", "ux", ""]
        );
        {
            let memory = cart.memory.lock().unwrap();
            assert_eq!(&memory[..1024], data.as_slice());
            assert!(memory[1024..].iter().all(|&b| b == 0xFF));
        }

        assert_eq!(session.verify_cartridge(&data).unwrap(), VerifyOutcome::Match);
        let commands = session.channel().port().commands();
        assert!(commands.contains(&"setromsize 1024".to_string()));
        assert!(!commands[6..].contains(&"init".to_string()));
    }

    #[test]
    fn test_verify_without_setromsize_reads_whole_cartridge() {
        let data = image(512);
        let mut memory = data.clone();
        memory.resize(2048, 0xFF);
        let cart = FakeCartridge::new(INIT_FLASH, memory).with_version("1.2");
        let mut session = Session::new(cart.port());

        assert_eq!(
            session.verify_cartridge(&data).unwrap(),
            VerifyOutcome::PrefixMatch { extra: 1536 }
        );
        let commands = session.channel().port().commands();
        assert!(commands.contains(&"init".to_string()));
        assert!(commands.iter().all(|c| !c.starts_with("setromsize")));
    }

    #[test]
    fn test_program_pads_last_block() {
        let cart = FakeCartridge::new(INIT_FLASH, vec![0xFF; 256]);
        let mut session = Session::new(cart.port());

        session.program(&[0x42; 200]).unwrap();

        let memory = cart.memory.lock().unwrap();
        assert!(memory[..200].iter().all(|&b| b == 0x42));
        assert!(memory[200..].iter().all(|&b| b == 0x1A));
    }

    #[test]
    fn test_program_with_ready_banner_handshake() {
        let cart = FakeCartridge::new(INIT_FLASH, vec![0xFF; 256]);
        let mut session = Session::new(cart.port()).with_config(crate::session::SessionConfig {
            upload_handshake: UploadHandshake::ReadyPrompt,
            ..Default::default()
        });

        session.program(&[0x42; 128]).unwrap();

        let memory = cart.memory.lock().unwrap();
        assert!(memory[..128].iter().all(|&b| b == 0x42));
        assert!(memory[128..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_verify_detects_difference() {
        let cart = FakeCartridge::new(INIT_FLASH, image(256)).with_version("1.3");
        let mut expected = image(256);
        expected[200] ^= 0xFF;
        let mut session = Session::new(cart.port());

        assert_eq!(
            session.verify_cartridge(&expected).unwrap(),
            VerifyOutcome::Mismatch { offset: 200 }
        );
    }

    #[test]
    fn test_blank_check_needs_capability() {
        let cart = FakeCartridge::new(INIT_FLASH, vec![0xFF; 256]).with_version("1.1");
        let mut session = Session::new(cart.port());

        let err = session.blank_check().unwrap_err();
        assert!(matches!(
            err,
            Error::CapabilityUnsupported {
                capability: Capability::BlankCheck,
                ..
            }
        ));
        assert!(!session.channel().port().commands().contains(&"bc".to_string()));
    }

    #[test]
    fn test_blank_status_uses_device_or_readback() {
        let cart = FakeCartridge::new(INIT_FLASH, vec![0xFF; 256]).with_version("1.2");
        let mut session = Session::new(cart.port());
        assert_eq!(
            session.blank_status().unwrap(),
            BlankStatus::Device { blank: true }
        );

        let mut memory = vec![0xFF; 256];
        memory[10] = 0;
        let cart = FakeCartridge::new(INIT_FLASH, memory);
        let mut session = Session::new(cart.port());
        let status = session.blank_status().unwrap();
        assert_eq!(
            status,
            BlankStatus::Readback {
                non_blank_bytes: 1,
                size: 256
            }
        );
        assert!(!status.is_blank());
    }

    #[test]
    fn test_set_rom_size_rejected() {
        let port = ScriptedPort::programmer(&[
            ("version", "version\r\nVersion: 1.3"),
            ("setromsize 0", "ERROR"),
        ]);
        let mut session = Session::new(port);
        assert!(matches!(session.set_rom_size(0), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_enter_bootloader_disconnect_is_success() {
        let port = ScriptedPort::new(|data| match command_line(data).as_deref() {
            Some("bootloader") => Reply::Disconnect,
            Some(_) => Reply::text("\r\n> "),
            None => Reply::Silent,
        });
        let mut session = Session::new(port);

        assert_eq!(
            session.enter_bootloader().unwrap(),
            ExchangeOutcome::Disconnected
        );
    }

    #[test]
    fn test_enter_bootloader_silence_after_settle() {
        let port = ScriptedPort::new(|data| match command_line(data).as_deref() {
            Some("bootloader") => Reply::Silent,
            Some(_) => Reply::text("\r\n> "),
            None => Reply::Silent,
        });
        let mut session = Session::new(port).with_config(crate::session::SessionConfig {
            bootloader_settle: Duration::from_millis(10),
            ..Default::default()
        });

        assert_eq!(
            session.enter_bootloader().unwrap(),
            ExchangeOutcome::Disconnected
        );
    }
}
