//! Serial link abstraction.
//!
//! The programmer enumerates as a USB CDC serial device and talks plain
//! 115200-8-N-1. Everything above this module only needs the [`Port`] trait,
//! so protocol code is testable against in-memory ports.
//!
//! ```text
//! +---------------------+
//! |  Workflows / DFU    |
//! +----------+----------+
//!            |
//! +----------v----------+   +--------------------+
//! |  CommandChannel     |   |  TransferAdapter   |
//! +----------+----------+   +---------+----------+
//!            |                        |
//! +----------v------------------------v----------+
//! |                 Port trait                   |
//! +----------------------+-----------------------+
//!                        |
//!             +----------v----------+
//!             | NativePort          |
//!             | (serialport)        |
//!             +---------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Baud rate used by the programmer firmware.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Serial port configuration.
///
/// Framing is fixed at 8 data bits, no parity, one stop bit.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Initial read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialConfig {
    /// Create a configuration for the given port at the programmer's baud rate.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Byte channel to the programmer.
///
/// Reads honour the current timeout and report an expired timeout as
/// [`std::io::ErrorKind::TimedOut`].
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Discard bytes received but not yet read.
    fn clear_input(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> std::io::Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)
    }
}

/// Trait for listing available serial ports.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
