//! # smsprog
//!
//! A library for driving the SMS/Game Gear cartridge reader/programmer.
//!
//! The programmer is a USB-serial device answering line-oriented ASCII
//! commands. This crate provides:
//!
//! - The command/response exchange engine and the firmware's response markers
//! - Firmware version negotiation and capability gating
//! - Cartridge workflows: read, erase, program, blank check and verify
//! - XMODEM bulk transfers behind a replaceable [`TransferProtocol`]
//! - Programmer firmware updates through `dfu-programmer`
//! - A worker thread for long operations with cooperative cancellation
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//!
//! Any other byte channel can be used by implementing [`Port`].
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use smsprog::Session;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let mut session = Session::open("/dev/ttyACM0")?;
//!
//!         let info = session.cartridge_info()?;
//!         println!("Cartridge: {:?}", info.kind);
//!
//!         let image = std::fs::read("game.sms")?;
//!         session.erase_and_program(&image)?;
//!         assert!(session.verify_cartridge(&image)?.is_ok());
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod capabilities;
pub mod error;
pub mod firmware;
pub mod port;
pub mod protocol;
pub mod rom;
pub mod session;
pub mod transfer;
pub mod worker;
pub mod workflow;

#[cfg(test)]
mod testing;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    cancel::CancelToken,
    capabilities::{Capability, ProgrammerCapabilities},
    error::{Error, ErrorCategory, FlashStep, Result},
    firmware::{DfuProgrammer, FirmwareUpdater, FlashTool, ToolOutput, UpdateConfig, UpdateState},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{CommandChannel, ExchangeOutcome, Terminator, Xmodem, XmodemConfig},
    rom::RomHeader,
    session::{Session, SessionConfig},
    transfer::{
        ByteChannel, Direction, Initiation, ProgressFn, TransferProtocol, UploadHandshake,
    },
    worker::{Job, JobOutput, Worker, WorkerEvent, spawn_job, spawn_update},
    workflow::{BlankStatus, CartridgeInfo, CartridgeKind, VerifyOutcome, verify},
};
