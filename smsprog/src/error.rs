//! Error types for smsprog.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::capabilities::Capability;

/// Result type for smsprog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Step of a firmware update that invokes the flashing tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStep {
    /// Erasing the device firmware.
    Erase,
    /// Writing the new firmware image.
    Flash,
}

impl fmt::Display for FlashStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Erase => write!(f, "erase"),
            Self::Flash => write!(f, "flash"),
        }
    }
}

/// Error type for smsprog operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The serial link broke while talking to the programmer.
    #[error("Connection error: {0}")]
    Connection(#[source] io::Error),

    /// Opening or configuring the serial port failed.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Local I/O error (files, subprocess plumbing).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A response could not be parsed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The negotiated firmware lacks a command.
    #[error("Firmware {version} does not support '{capability}'")]
    CapabilityUnsupported {
        /// Missing capability.
        capability: Capability,
        /// Negotiated firmware version.
        version: String,
    },

    /// The inserted cartridge cannot be written.
    #[error("Cartridge type error: {0}")]
    CartridgeType(String),

    /// Bulk transfer failed.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// The external flashing tool is missing or unusable.
    #[error("Flashing tool not found: {0}")]
    ToolNotFound(String),

    /// The device did not show up in bootloader mode.
    #[error("Bootloader not detected after {attempts} attempts")]
    BootloaderTimeout {
        /// Number of status polls performed.
        attempts: u32,
    },

    /// A flashing tool step exited with a failure status.
    #[error("Firmware flashing failed at step {step} (exit status {})", status.map_or_else(|| "unknown".to_string(), |s| s.to_string()))]
    FlashStepFailed {
        /// Failing step.
        step: FlashStep,
        /// Process exit code, if the process exited normally.
        status: Option<i32>,
    },

    /// Firmware image missing or unreadable.
    #[error("Invalid firmware image: {0}")]
    FirmwareImage(String),

    /// Operation cancelled through a [`CancelToken`](crate::CancelToken).
    #[error("Operation cancelled")]
    Cancelled,
}

/// User-visible failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Could not reach the device.
    Unreachable,
    /// The device (or its cartridge) rejected the operation.
    Rejected,
    /// Firmware flashing failed.
    FirmwareUpdate,
    /// The operation was cancelled.
    Cancelled,
    /// Local problem unrelated to the device.
    Local,
}

impl Error {
    /// Classify this error for reporting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_) => ErrorCategory::Unreachable,
            #[cfg(feature = "native")]
            Self::Serial(_) => ErrorCategory::Unreachable,
            Self::Protocol(_)
            | Self::CapabilityUnsupported { .. }
            | Self::CartridgeType(_)
            | Self::Transfer(_) => ErrorCategory::Rejected,
            Self::ToolNotFound(_)
            | Self::BootloaderTimeout { .. }
            | Self::FlashStepFailed { .. }
            | Self::FirmwareImage(_) => ErrorCategory::FirmwareUpdate,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Io(_) => ErrorCategory::Local,
        }
    }

    /// Whether the link reported the device as gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            _ => false,
        }
    }
}
