//! Programmer session.
//!
//! A [`Session`] owns the link to one programmer together with everything
//! that used to be global state in simpler tools: the negotiated firmware
//! capabilities, the transfer protocol, the progress callback and the
//! cancellation token. Owning the port by value keeps every exchange and
//! transfer strictly sequential.
//!
//! ## Example
//!
//! ```rust,no_run
//! use smsprog::Session;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = Session::open("/dev/ttyACM0")?
//!         .with_progress(|_, bytes| eprintln!("{bytes} bytes"));
//!
//!     let caps = session.capabilities()?;
//!     println!("Firmware {}", caps.version);
//!
//!     let rom = session.read_rom()?;
//!     std::fs::write("cart.sms", rom)?;
//!     Ok(())
//! }
//! ```

use {
    crate::{
        cancel::CancelToken,
        capabilities::{self, Capability, ProgrammerCapabilities},
        error::{Error, Result},
        port::Port,
        protocol::{exchange::CommandChannel, xmodem::Xmodem},
        transfer::{self, Direction, Initiation, ProgressFn, TransferProtocol, UploadHandshake},
    },
    log::{debug, warn},
    std::{io::Write, time::Duration},
};

/// Time the device gets to drop off the bus after `bootloader`.
pub const BOOTLOADER_SETTLE: Duration = Duration::from_secs(2);

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How the firmware announces upload readiness.
    pub upload_handshake: UploadHandshake,
    /// Wait for the disconnect after the bootloader command.
    pub bootloader_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            upload_handshake: UploadHandshake::default(),
            bootloader_settle: BOOTLOADER_SETTLE,
        }
    }
}

/// Connection to one programmer.
pub struct Session<P: Port> {
    pub(crate) channel: CommandChannel<P>,
    config: SessionConfig,
    capabilities: Option<ProgrammerCapabilities>,
    transfer: Box<dyn TransferProtocol>,
    progress: Option<Box<ProgressFn>>,
}

#[cfg(feature = "native")]
impl Session<crate::port::NativePort> {
    /// Open the programmer on `port_name` at 115200-8-N-1.
    pub fn open(port_name: &str) -> Result<Self> {
        let port = crate::port::NativePort::open_simple(port_name)?;
        Ok(Self::new(port))
    }
}

impl<P: Port> Session<P> {
    /// Create a session over an already open port.
    pub fn new(port: P) -> Self {
        Self {
            channel: CommandChannel::new(port),
            config: SessionConfig::default(),
            capabilities: None,
            transfer: Box::new(Xmodem::new()),
            progress: None,
        }
    }

    /// Replace the session settings.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Observe a caller-owned cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.channel = self
            .channel
            .with_cancel_token(cancel);
        self
    }

    /// Use another transfer protocol implementation.
    #[must_use]
    pub fn with_transfer_protocol(mut self, protocol: impl TransferProtocol + 'static) -> Self {
        self.transfer = Box::new(protocol);
        self
    }

    /// Report transfer progress to `callback`.
    #[must_use]
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Direction, usize) + Send + 'static,
    {
        self.set_progress(callback);
        self
    }

    /// Replace the progress callback.
    pub fn set_progress<F>(&mut self, callback: F)
    where
        F: FnMut(Direction, usize) + Send + 'static,
    {
        self.progress = Some(Box::new(callback));
    }

    /// Remove the progress callback.
    pub fn clear_progress(&mut self) {
        self.progress = None;
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Token observed by every read of this session.
    pub fn cancel_token(&self) -> &CancelToken {
        self.channel.cancel_token()
    }

    /// The exchange engine.
    pub fn channel(&mut self) -> &mut CommandChannel<P> {
        &mut self.channel
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.channel.into_port()
    }

    /// Duration of the last command exchange.
    pub fn last_exchange_duration(&self) -> Option<Duration> {
        self.channel
            .last_exchange_duration()
    }

    /// Capabilities negotiated so far, if any.
    pub fn cached_capabilities(&self) -> Option<&ProgrammerCapabilities> {
        self.capabilities.as_ref()
    }

    /// Query the firmware version, replacing any cached result.
    pub fn negotiate(&mut self) -> Result<&ProgrammerCapabilities> {
        let caps = capabilities::negotiate(&mut self.channel)?;
        Ok(self.capabilities.insert(caps))
    }

    /// Firmware capabilities, negotiated on first use.
    pub fn capabilities(&mut self) -> Result<&ProgrammerCapabilities> {
        match self.capabilities {
            Some(ref caps) => Ok(caps),
            None => self.negotiate(),
        }
    }

    /// Fail unless the firmware supports `capability`.
    pub fn require(&mut self, capability: Capability) -> Result<()> {
        self.capabilities()?.require(capability)
    }

    /// Send the abort sequence.
    pub fn abort(&mut self) -> Result<()> {
        self.channel.abort()
    }

    /// Read the cartridge stream into `sink` (no `init` beforehand).
    pub fn download(&mut self, sink: &mut dyn Write) -> Result<usize> {
        let result = transfer::download(
            &mut self.channel,
            &Initiation::download(),
            &mut *self.transfer,
            sink,
            self.progress.as_deref_mut(),
        );
        self.after_transfer(result)
    }

    /// Write `data` to the cartridge (no `init` beforehand).
    pub fn upload(&mut self, data: &[u8]) -> Result<usize> {
        let initiation = Initiation::upload(self.config.upload_handshake);
        let result = transfer::upload(
            &mut self.channel,
            &initiation,
            &mut *self.transfer,
            data,
            self.progress.as_deref_mut(),
        );
        self.after_transfer(result)
    }

    fn after_transfer(&mut self, result: Result<usize>) -> Result<usize> {
        if let Err(Error::Cancelled) = result {
            debug!("Transfer cancelled, asking the device to stop");
            if let Err(e) = self.channel.abort() {
                warn!("Could not send abort sequence: {e}");
            }
        }
        result
    }
}
