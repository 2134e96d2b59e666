//! Protocol implementations.

pub mod crc;
pub mod exchange;
pub mod response;
pub mod xmodem;

// Re-export common types
pub use exchange::{CommandChannel, ExchangeOutcome, Terminator};
pub use xmodem::{ChecksumMode, Xmodem, XmodemConfig};
