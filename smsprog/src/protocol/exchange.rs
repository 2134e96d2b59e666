//! Command/response exchange with the programmer.
//!
//! Every exchange is a single round trip: stale input is discarded, the
//! command goes out terminated by CR LF and the answer is accumulated until
//! a [`Terminator`] matches. There is no overall deadline; the firmware may
//! legitimately take a long time (a chip erase runs well past 30 seconds).
//! The only way to give up early is the [`CancelToken`], checked once per
//! read slice.

use {
    crate::{
        cancel::CancelToken,
        error::{Error, Result},
        port::Port,
        protocol::response::{PROMPT, decode_ascii_lossy},
    },
    log::{debug, trace, warn},
    std::{
        io::ErrorKind,
        time::{Duration, Instant},
    },
};

/// Timeout of a single read while waiting for an answer.
pub const READ_SLICE: Duration = Duration::from_millis(100);

/// Bytes requested per read.
const READ_CHUNK: usize = 100;

/// Cancel (CAN).
pub const CANCEL_BYTE: u8 = 0x18;

/// Interrupt (Ctrl-C).
pub const INTERRUPT_BYTE: u8 = 0x03;

/// How the end of an answer is recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    /// The answer ends with this literal.
    EndsWith(String),
    /// The answer contains this literal anywhere.
    Contains(String),
}

impl Terminator {
    /// Match the answer's trailing text.
    pub fn ends_with(text: impl Into<String>) -> Self {
        Self::EndsWith(text.into())
    }

    /// Match anywhere in the answer.
    pub fn contains(text: impl Into<String>) -> Self {
        Self::Contains(text.into())
    }

    /// The command prompt at the end of the answer.
    pub fn prompt() -> Self {
        Self::ends_with(PROMPT)
    }

    /// Whether `response` is complete.
    pub fn matches(&self, response: &str) -> bool {
        match self {
            Self::EndsWith(text) => response.ends_with(text.as_str()),
            Self::Contains(text) => response.contains(text.as_str()),
        }
    }
}

impl Default for Terminator {
    fn default() -> Self {
        Self::prompt()
    }
}

/// Result of a command that may reset the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The device answered normally.
    Answered(String),
    /// The link dropped or went silent, which is what a reset looks like.
    Disconnected,
}

/// Exchange engine owning the link.
pub struct CommandChannel<P: Port> {
    port: P,
    cancel: CancelToken,
    last_exchange: Option<Duration>,
}

impl<P: Port> CommandChannel<P> {
    /// Wrap an open port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            cancel: CancelToken::new(),
            last_exchange: None,
        }
    }

    /// Use a caller-owned cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The token observed by this channel.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the channel and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Wall-clock duration of the last completed exchange.
    pub fn last_exchange_duration(&self) -> Option<Duration> {
        self.last_exchange
    }

    /// Send `command` and wait for the prompt.
    pub fn command(&mut self, command: &str) -> Result<String> {
        self.exchange(command, &Terminator::prompt())
    }

    /// Two empty exchanges to get back in step with the prompt.
    pub fn resync(&mut self) -> Result<()> {
        self.command("")?;
        self.command("")?;
        Ok(())
    }

    /// Send `command` and accumulate the answer until `terminator` matches.
    pub fn exchange(&mut self, command: &str, terminator: &Terminator) -> Result<String> {
        let start = Instant::now();
        self.send(command)?;
        self.port.set_timeout(READ_SLICE)?;

        let mut response = String::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            self.cancel.check()?;
            match self.port.read(&mut buf) {
                Ok(0) => {},
                Ok(n) => {
                    response.push_str(&decode_ascii_lossy(&buf[..n]));
                    if terminator.matches(&response) {
                        break;
                    }
                },
                Err(e) if is_idle(e.kind()) => {},
                Err(e) => return Err(Error::Connection(e)),
            }
        }

        let elapsed = start.elapsed();
        self.last_exchange = Some(elapsed);
        debug!("Command {command:?} answered in {elapsed:?}");
        trace!("Answer: {response:?}");
        Ok(response)
    }

    /// Send `command` for which the device is expected to reset.
    ///
    /// A link error while writing or reading, or no matching answer within
    /// `settle`, counts as [`ExchangeOutcome::Disconnected`].
    pub fn exchange_expecting_disconnect(
        &mut self,
        command: &str,
        terminator: &Terminator,
        settle: Duration,
    ) -> Result<ExchangeOutcome> {
        match self.send(command) {
            Ok(()) => {},
            Err(e) if e.is_disconnect() => {
                debug!("Link lost while sending {command:?}: {e}");
                return Ok(ExchangeOutcome::Disconnected);
            },
            Err(e) => return Err(e),
        }
        if let Err(e) = self.port.set_timeout(READ_SLICE) {
            debug!("Link lost after {command:?}: {e}");
            return Ok(ExchangeOutcome::Disconnected);
        }

        let start = Instant::now();
        let mut response = String::new();
        let mut buf = [0u8; READ_CHUNK];
        while start.elapsed() < settle {
            self.cancel.check()?;
            match self.port.read(&mut buf) {
                Ok(0) => {},
                Ok(n) => {
                    response.push_str(&decode_ascii_lossy(&buf[..n]));
                    if terminator.matches(&response) {
                        self.last_exchange = Some(start.elapsed());
                        return Ok(ExchangeOutcome::Answered(response));
                    }
                },
                Err(e) if is_idle(e.kind()) => {},
                Err(e) => {
                    debug!("Link lost after {command:?}: {e}");
                    return Ok(ExchangeOutcome::Disconnected);
                },
            }
        }

        warn!("No answer to {command:?} within {settle:?}, assuming the device reset");
        Ok(ExchangeOutcome::Disconnected)
    }

    /// Discard pending input and write `command` with CR LF.
    pub fn send(&mut self, command: &str) -> Result<()> {
        self.cancel.check()?;
        self.port.clear_input()?;

        let mut line = Vec::with_capacity(command.len() + 2);
        line.extend_from_slice(command.as_bytes());
        line.extend_from_slice(b"\r\n");
        trace!("Sending {command:?}");
        self.port
            .write_all_bytes(&line)
            .map_err(Error::Connection)
    }

    /// Ask the device to stop whatever it is doing.
    ///
    /// Fire and forget: a pending exchange is not unblocked by this.
    pub fn abort(&mut self) -> Result<()> {
        debug!("Sending abort sequence");
        self.port
            .write_all_bytes(&[CANCEL_BYTE])
            .map_err(Error::Connection)?;
        self.port
            .write_all_bytes(&[INTERRUPT_BYTE])
            .map_err(Error::Connection)
    }
}

fn is_idle(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedPort, command_line};

    #[test]
    fn test_terminator_modes() {
        let suffix = Terminator::ends_with("\r\n> ");
        assert!(suffix.matches("done\r\n> "));
        assert!(!suffix.matches("done\r\n> more"));

        let contains = Terminator::contains("CTRL+C to cancel.");
        assert!(contains.matches("start... CTRL+C to cancel.\r\nxyz"));
        assert!(!contains.matches("start..."));

        assert_eq!(Terminator::default(), Terminator::prompt());
    }

    #[test]
    fn test_exchange_flushes_and_appends_crlf() {
        let mut port = ScriptedPort::programmer(&[("init", "Cartridge type: ROM")]);
        port.preload(b"stale junk\r\n> ");
        let mut channel = CommandChannel::new(port);

        let answer = channel.command("init").unwrap();

        assert_eq!(answer, "Cartridge type: ROM\r\n> ");
        assert_eq!(channel.port().written, b"init\r\n");
        assert_eq!(channel.port().clears, 1);
        assert!(channel.last_exchange_duration().is_some());
    }

    #[test]
    fn test_suffix_mode_waits_for_trailing_terminator() {
        let port = ScriptedPort::new(|data| {
            if command_line(data).is_some() {
                Reply::Chunks(vec![b"one\r\n> two".to_vec(), b"\r\n> ".to_vec()])
            } else {
                Reply::Silent
            }
        });
        let mut channel = CommandChannel::new(port);

        let answer = channel.command("x").unwrap();
        assert_eq!(answer, "one\r\n> two\r\n> ");
    }

    #[test]
    fn test_contains_mode_returns_on_first_occurrence() {
        let port = ScriptedPort::new(|data| {
            if command_line(data).is_some() {
                Reply::Chunks(vec![b"one\r\n> two".to_vec(), b"\r\n> ".to_vec()])
            } else {
                Reply::Silent
            }
        });
        let mut channel = CommandChannel::new(port);

        let answer = channel
            .exchange("x", &Terminator::contains("\r\n> "))
            .unwrap();
        assert_eq!(answer, "one\r\n> two");
    }

    #[test]
    fn test_invalid_bytes_are_not_fatal() {
        let port = ScriptedPort::new(|data| {
            if command_line(data).is_some() {
                Reply::bytes(b"\xffgarbage\xc3\r\n> ")
            } else {
                Reply::Silent
            }
        });
        let mut channel = CommandChannel::new(port);

        assert_eq!(channel.command("").unwrap(), "garbage\r\n> ");
    }

    #[test]
    fn test_cancelled_token_ends_exchange() {
        let token = CancelToken::new();
        let mut channel =
            CommandChannel::new(ScriptedPort::new(|_| Reply::Silent)).with_cancel_token(token.clone());
        token.cancel();

        assert!(matches!(channel.command("ce"), Err(Error::Cancelled)));
    }

    #[test]
    fn test_read_failure_is_connection_error() {
        let port = ScriptedPort::new(|_| Reply::Disconnect);
        let mut channel = CommandChannel::new(port);

        let err = channel.command("init").unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn test_resync_sends_two_empty_commands() {
        let mut channel = CommandChannel::new(ScriptedPort::programmer(&[]));
        channel.resync().unwrap();
        assert_eq!(channel.port().commands(), ["", ""]);
    }

    #[test]
    fn test_abort_writes_cancel_then_interrupt() {
        let mut channel = CommandChannel::new(ScriptedPort::new(|_| Reply::Silent));
        channel.abort().unwrap();
        assert_eq!(channel.port().written, [0x18, 0x03]);
    }

    #[test]
    fn test_disconnect_is_an_outcome() {
        let port = ScriptedPort::new(|data| {
            if command_line(data).as_deref() == Some("bootloader") {
                Reply::Disconnect
            } else {
                Reply::Silent
            }
        });
        let mut channel = CommandChannel::new(port);

        let outcome = channel
            .exchange_expecting_disconnect(
                "bootloader",
                &Terminator::prompt(),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(outcome, ExchangeOutcome::Disconnected);
    }

    #[test]
    fn test_write_failure_is_a_disconnect() {
        let mut port = ScriptedPort::new(|_| Reply::Silent);
        port.close().unwrap();
        let mut channel = CommandChannel::new(port);

        let outcome = channel
            .exchange_expecting_disconnect(
                "bootloader",
                &Terminator::prompt(),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(outcome, ExchangeOutcome::Disconnected);
        assert!(matches!(channel.command("init"), Err(Error::Connection(_))));
    }

    #[test]
    fn test_cancel_before_disconnecting_command_is_an_error() {
        let token = CancelToken::new();
        let mut channel =
            CommandChannel::new(ScriptedPort::new(|_| Reply::Silent)).with_cancel_token(token.clone());
        token.cancel();

        let result = channel.exchange_expecting_disconnect(
            "bootloader",
            &Terminator::prompt(),
            Duration::from_secs(2),
        );
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_silence_counts_as_disconnect() {
        let mut channel = CommandChannel::new(ScriptedPort::new(|_| Reply::Silent));
        let outcome = channel
            .exchange_expecting_disconnect("boot", &Terminator::prompt(), Duration::from_millis(20))
            .unwrap();
        assert_eq!(outcome, ExchangeOutcome::Disconnected);
    }

    #[test]
    fn test_answer_before_reset_is_reported() {
        let mut channel = CommandChannel::new(ScriptedPort::programmer(&[("bootloader", "ERROR")]));
        let outcome = channel
            .exchange_expecting_disconnect(
                "bootloader",
                &Terminator::prompt(),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(outcome, ExchangeOutcome::Answered("ERROR\r\n> ".into()));
    }
}
